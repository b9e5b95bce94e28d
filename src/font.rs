//! Font loading for the overlay compositor
//!
//! The configured `font_path` may be a font file or a fontconfig name
//! ("DejaVu Sans Bold"). Anything that fails to resolve falls back to a system font.

use anyhow::{anyhow, Context, Result};
use fontconfig::{Fontconfig, Pattern};
use fontdue::{Font, FontSettings};
use std::ffi::CString;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Style suffixes recognized when splitting "Family Style" names.
/// Longer names first so "SemiBold Italic" wins over "Bold Italic".
const KNOWN_STYLES: &[&str] = &[
    "SemiBold Italic",
    "Bold Italic",
    "Bold Oblique",
    "Light Italic",
    "SemiBold",
    "ExtraBold",
    "Italic",
    "Oblique",
    "Bold",
    "Light",
    "Medium",
    "Regular",
];

/// Last-resort font files for systems without a usable fontconfig match
const FALLBACK_PATHS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/usr/share/fonts/liberation/LiberationSans-Regular.ttf",
];

pub fn from_path(path: &Path) -> Result<Font> {
    let data = fs::read(path).with_context(|| format!("Failed to read font file: {}", path.display()))?;
    let font = Font::from_bytes(data, FontSettings::default())
        .map_err(|e| anyhow!("Failed to parse font {}: {}", path.display(), e))?;
    debug!(path = %path.display(), "Loaded font");
    Ok(font)
}

/// Split "Family Style" into family and a known trailing style
fn split_style(font_name: &str) -> (&str, Option<&'static str>) {
    for style in KNOWN_STYLES {
        if let Some(prefix) = font_name.strip_suffix(style)
            && (prefix.is_empty() || prefix.ends_with(' '))
        {
            return (prefix.trim(), Some(style));
        }
    }
    (font_name, None)
}

/// Resolve a family (optionally with style) to a font file via fontconfig
pub fn find_font_path(font_name: &str) -> Result<PathBuf> {
    let fc = Fontconfig::new().context("Failed to initialize fontconfig")?;
    let (family, style) = split_style(font_name);

    let mut pattern = Pattern::new(&fc);
    let family_cstr = CString::new(family).with_context(|| format!("Invalid family name: {}", family))?;
    pattern.add_string(fontconfig::FC_FAMILY, &family_cstr);
    if let Some(style) = style {
        let style_cstr = CString::new(style).with_context(|| format!("Invalid style name: {}", style))?;
        pattern.add_string(fontconfig::FC_STYLE, &style_cstr);
    }

    let matched = pattern.font_match();
    if let Some(matched_family) = matched.get_string(fontconfig::FC_FAMILY)
        && !matched_family.eq_ignore_ascii_case(family)
    {
        anyhow::bail!("Font '{}' not found - fontconfig returned family '{}' instead", font_name, matched_family);
    }

    let path = PathBuf::from(
        matched
            .filename()
            .with_context(|| format!("No font file found for '{}'", font_name))?,
    );
    if !path.exists() {
        anyhow::bail!("Font file path '{}' does not exist", path.display());
    }
    debug!(font = font_name, path = %path.display(), "Resolved font via fontconfig");
    Ok(path)
}

fn system_font() -> Result<Font> {
    if let Ok(path) = find_font_path("Sans")
        && let Ok(font) = from_path(&path)
    {
        return Ok(font);
    }
    FALLBACK_PATHS
        .iter()
        .find_map(|path| from_path(Path::new(path)).ok())
        .ok_or_else(|| anyhow!("Could not find any system fonts. Tried fontconfig 'Sans' and {:?}", FALLBACK_PATHS))
}

/// Load the configured font: a file path, a fontconfig name, or the system default when empty
pub fn load(font_path: &str) -> Result<Font> {
    let requested = font_path.trim();
    if requested.is_empty() {
        info!("No font configured, using system font");
        return system_font();
    }

    let path = Path::new(requested);
    let resolved = if path.is_file() {
        from_path(path)
    } else {
        find_font_path(requested).and_then(|p| from_path(&p))
    };

    match resolved {
        Ok(font) => {
            info!(font = requested, "Loaded overlay font");
            Ok(font)
        }
        Err(e) => {
            warn!(font = requested, error = %e, "Failed to load configured font, falling back to system font");
            system_font()
        }
    }
}
