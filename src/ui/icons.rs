//! Shared UI icons.
//!
//! Each icon falls back to a plain-text marker on terminals without emoji.

use console::Emoji;

// Status indicators
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "[WARN]");
pub static STOP: Emoji<'_, '_> = Emoji("🛑 ", "[STOP]");

// Stage indicators
pub static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>]");
pub static PARALLEL: Emoji<'_, '_> = Emoji("🔀 ", "[||]");
pub static CLOCK: Emoji<'_, '_> = Emoji("⏱️  ", "[T]");

// Transport indicators
pub static UPLOAD: Emoji<'_, '_> = Emoji("📤 ", "[UP]");
pub static HOST: Emoji<'_, '_> = Emoji("🖥️  ", "[HOST]");
