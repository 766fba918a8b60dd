use ext_dom::Document;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Selectable dark-mode probes (config: `dark_mode.strategies`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DarkModeStrategy {
    /// Any element carrying `data-color-mode="dark"`.
    ColorModeAttribute,
    /// A `<meta name="darkreader">` injected by the Dark Reader extension.
    DarkreaderMarker,
    /// `prefers-color-scheme: dark` media query.
    PrefersColorScheme,
}

/// Decides whether a page already renders dark.
pub trait DarkModeProbe {
    fn name(&self) -> &'static str;

    fn is_dark(&self, doc: &Document) -> bool;
}

#[derive(Debug, Default)]
pub struct ColorModeAttribute;

impl DarkModeProbe for ColorModeAttribute {
    fn name(&self) -> &'static str {
        "color-mode-attribute"
    }

    fn is_dark(&self, doc: &Document) -> bool {
        doc.find(|d, node| d.attribute(node, "data-color-mode").is_some())
            .and_then(|node| doc.attribute(node, "data-color-mode"))
            == Some("dark")
    }
}

#[derive(Debug, Default)]
pub struct DarkReaderMarker;

impl DarkModeProbe for DarkReaderMarker {
    fn name(&self) -> &'static str {
        "darkreader-marker"
    }

    fn is_dark(&self, doc: &Document) -> bool {
        doc.find_meta("darkreader").is_some()
    }
}

#[derive(Debug, Default)]
pub struct PrefersColorScheme;

impl DarkModeProbe for PrefersColorScheme {
    fn name(&self) -> &'static str {
        "prefers-color-scheme"
    }

    fn is_dark(&self, doc: &Document) -> bool {
        doc.prefers_dark_color_scheme()
    }
}

/// Any-of combination of probes.
pub struct DarkModeDetector {
    probes: Vec<Box<dyn DarkModeProbe>>,
}

impl std::fmt::Debug for DarkModeDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.probes.iter().map(|p| p.name()))
            .finish()
    }
}

impl Default for DarkModeDetector {
    fn default() -> Self {
        Self::new(&[
            DarkModeStrategy::ColorModeAttribute,
            DarkModeStrategy::DarkreaderMarker,
        ])
    }
}

impl DarkModeDetector {
    pub fn new(strategies: &[DarkModeStrategy]) -> Self {
        let probes = strategies
            .iter()
            .map(|strategy| -> Box<dyn DarkModeProbe> {
                match strategy {
                    DarkModeStrategy::ColorModeAttribute => Box::new(ColorModeAttribute),
                    DarkModeStrategy::DarkreaderMarker => Box::new(DarkReaderMarker),
                    DarkModeStrategy::PrefersColorScheme => Box::new(PrefersColorScheme),
                }
            })
            .collect();
        Self { probes }
    }

    /// Detector that never reports dark mode.
    pub fn none() -> Self {
        Self { probes: Vec::new() }
    }

    pub fn with_probe(mut self, probe: Box<dyn DarkModeProbe>) -> Self {
        self.probes.push(probe);
        self
    }

    pub fn is_dark(&self, doc: &Document) -> bool {
        match self.probes.iter().find(|probe| probe.is_dark(doc)) {
            Some(probe) => {
                debug!(probe = probe.name(), "document is in dark mode");
                true
            }
            None => false,
        }
    }
}
