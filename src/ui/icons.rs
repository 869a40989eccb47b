//! Shared UI icons.
//!
//! Each icon falls back to a plain ASCII tag when the terminal cannot render emoji.

use console::Emoji;

// Status indicators
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static CLOCK: Emoji<'_, '_> = Emoji("⏱️  ", "[T]");
pub static PAUSE: Emoji<'_, '_> = Emoji("⏸️  ", "[||]");

// Artifact indicators
pub static PACKAGE: Emoji<'_, '_> = Emoji("📦 ", "[PKG]");
pub static SAVE: Emoji<'_, '_> = Emoji("💾 ", "[CKPT]");
