use clap::ValueEnum;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ColorChoice {
    Auto,
    Always,
    Never,
}

impl Default for ColorChoice {
    fn default() -> Self {
        ColorChoice::Always
    }
}

impl ColorChoice {
    pub fn as_str(self) -> &'static str {
        match self {
            ColorChoice::Auto => "auto",
            ColorChoice::Always => "always",
            ColorChoice::Never => "never",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(ColorChoice::Auto),
            "always" => Some(ColorChoice::Always),
            "never" => Some(ColorChoice::Never),
            _ => None,
        }
    }
}

static COLOR: OnceCell<ColorChoice> = OnceCell::new();

/// Fix the process-wide color setting from the command line and manifest,
/// in that order, then `CARGO_TERM_COLOR`. Only the first call wins; later
/// calls return the value already in effect.
pub fn init_color(cli: Option<ColorChoice>, manifest: Option<ColorChoice>) -> ColorChoice {
    *COLOR.get_or_init(|| pick_color(cli, manifest, env_color().as_deref()))
}

pub fn color() -> ColorChoice {
    COLOR
        .get()
        .copied()
        .unwrap_or_else(|| pick_color(None, None, env_color().as_deref()))
}

fn env_color() -> Option<String> {
    std::env::var("CARGO_TERM_COLOR").ok()
}

fn pick_color(cli: Option<ColorChoice>, manifest: Option<ColorChoice>, env: Option<&str>) -> ColorChoice {
    cli.or(manifest)
        .or_else(|| env.and_then(ColorChoice::parse))
        .unwrap_or_default()
}
