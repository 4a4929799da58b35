//! The frozen parameter manifest driving scene and full-console exports.
//!
//! The console exposes thousands of addressable parameters; this module
//! enumerates the subset a scene file carries, and on top of that the slot
//! headers, library banks and current-state pointers a full backup adds.
//! Section labels feed progress reporting ("channel strip 12", "snippet
//! headers").
//!
//! The address grammar is the console's own: channels are `/ch/NN` with a
//! two-digit index, show slots are `/-show/showfile/scene/NNN` with a
//! three-digit index.

/// Number of input channel strips.
pub const CHANNELS: u32 = 32;
/// Scene and snippet slots per bank.
pub const SLOTS: u32 = 100;
/// Presets per library bank.
pub const LIBRARY_SLOTS: u32 = 100;

/// A labelled run of addresses queried together.
#[derive(Debug, Clone)]
pub struct ManifestSection {
    pub label: String,
    pub addresses: Vec<String>,
}

/// Ordered list of sections; flattening yields the canonical file order.
#[derive(Debug, Clone)]
pub struct Manifest {
    sections: Vec<ManifestSection>,
}

impl Manifest {
    /// Addresses a single scene export covers.
    pub fn scene() -> Self {
        let mut sections = Vec::new();
        for ch in 1..=CHANNELS {
            sections.push(channel_section(ch));
        }
        sections.push(aux_section());
        sections.push(fx_return_section());
        sections.push(bus_section());
        sections.push(matrix_section());
        sections.push(main_section());
        sections.push(dca_section());
        sections.push(effects_section());
        sections.push(routing_section());
        sections.push(output_section());
        Self { sections }
    }

    /// Everything in [`Manifest::scene`] plus slot headers, library banks
    /// and the current surface state.
    pub fn full_backup() -> Self {
        let mut manifest = Self::scene();
        manifest.sections.push(ManifestSection {
            label: "scene headers".to_string(),
            addresses: (0..SLOTS)
                .flat_map(|slot| [scene_slot_name(slot), scene_slot_notes(slot)])
                .collect(),
        });
        manifest.sections.push(ManifestSection {
            label: "snippet headers".to_string(),
            addresses: (0..SLOTS)
                .flat_map(|slot| [snippet_slot_name(slot), snippet_slot_notes(slot)])
                .collect(),
        });
        manifest.sections.push(ManifestSection {
            label: "library presets".to_string(),
            addresses: ["ch", "fx", "r"]
                .iter()
                .flat_map(|bank| {
                    (1..=LIBRARY_SLOTS)
                        .map(move |slot| format!("/-libs/{}/{:03}/name", bank, slot))
                })
                .collect(),
        });
        manifest.sections.push(ManifestSection {
            label: "console state".to_string(),
            addresses: vec![
                "/-show/prepos/current".to_string(),
                "/-stat/selidx".to_string(),
                "/-stat/solo".to_string(),
                "/-prefs/clockrate".to_string(),
            ],
        });
        manifest
    }

    pub fn sections(&self) -> &[ManifestSection] {
        &self.sections
    }

    /// Total address count across all sections.
    pub fn len(&self) -> usize {
        self.sections.iter().map(|s| s.addresses.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate `(section label, address)` in canonical order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.sections.iter().flat_map(|section| {
            section
                .addresses
                .iter()
                .map(move |addr| (section.label.as_str(), addr.as_str()))
        })
    }
}

pub fn scene_slot_name(slot: u32) -> String {
    format!("/-show/showfile/scene/{:03}/name", slot)
}

pub fn scene_slot_notes(slot: u32) -> String {
    format!("/-show/showfile/scene/{:03}/notes", slot)
}

pub fn snippet_slot_name(slot: u32) -> String {
    format!("/-show/showfile/snippet/{:03}/name", slot)
}

pub fn snippet_slot_notes(slot: u32) -> String {
    format!("/-show/showfile/snippet/{:03}/notes", slot)
}

/// Progress label for an arbitrary address; mirrors the manifest's own
/// section labels so import progress reads like export progress.
pub fn section_label_for(address: &str) -> String {
    let mut parts = address.split('/').skip(1);
    let head = parts.next().unwrap_or_default();
    match head {
        "ch" => match parts.next() {
            Some(index) => format!("channel strip {}", index),
            None => "channel strips".to_string(),
        },
        "auxin" => "aux inputs".to_string(),
        "fxrtn" => "fx returns".to_string(),
        "bus" => "bus masters".to_string(),
        "mtx" => "matrices".to_string(),
        "main" => "main outputs".to_string(),
        "dca" => "dca groups".to_string(),
        "fx" => "effects".to_string(),
        "config" => match parts.next() {
            Some("routing") => "routing".to_string(),
            _ => "config".to_string(),
        },
        "outputs" => "output patching".to_string(),
        "-show" => match (parts.next(), parts.next()) {
            (Some("showfile"), Some("scene")) => "scene headers".to_string(),
            (Some("showfile"), Some("snippet")) => "snippet headers".to_string(),
            _ => "console state".to_string(),
        },
        "-libs" => "library presets".to_string(),
        "-stat" | "-prefs" | "-action" => "console state".to_string(),
        _ => "parameters".to_string(),
    }
}

fn channel_section(ch: u32) -> ManifestSection {
    let prefix = format!("/ch/{:02}", ch);
    let mut addresses = Vec::with_capacity(45);
    for leaf in [
        "config/name",
        "config/color",
        "config/source",
        "preamp/trim",
        "preamp/invert",
        "gate/on",
        "gate/thr",
        "dyn/on",
        "dyn/thr",
        "eq/on",
    ] {
        addresses.push(format!("{}/{}", prefix, leaf));
    }
    for band in 1..=4 {
        for leaf in ["type", "f", "g", "q"] {
            addresses.push(format!("{}/eq/{}/{}", prefix, band, leaf));
        }
    }
    for leaf in ["mix/on", "mix/fader", "mix/pan"] {
        addresses.push(format!("{}/{}", prefix, leaf));
    }
    for send in 1..=16 {
        addresses.push(format!("{}/mix/{:02}/level", prefix, send));
    }
    ManifestSection {
        label: format!("channel strip {:02}", ch),
        addresses,
    }
}

fn aux_section() -> ManifestSection {
    ManifestSection {
        label: "aux inputs".to_string(),
        addresses: (1..=8)
            .flat_map(|n| {
                ["config/name", "mix/on", "mix/fader", "mix/pan"]
                    .iter()
                    .map(move |leaf| format!("/auxin/{:02}/{}", n, leaf))
                    .collect::<Vec<_>>()
            })
            .collect(),
    }
}

fn fx_return_section() -> ManifestSection {
    ManifestSection {
        label: "fx returns".to_string(),
        addresses: (1..=8)
            .flat_map(|n| {
                ["mix/on", "mix/fader", "mix/pan"]
                    .iter()
                    .map(move |leaf| format!("/fxrtn/{:02}/{}", n, leaf))
                    .collect::<Vec<_>>()
            })
            .collect(),
    }
}

fn bus_section() -> ManifestSection {
    ManifestSection {
        label: "bus masters".to_string(),
        addresses: (1..=16)
            .flat_map(|n| {
                ["config/name", "mix/on", "mix/fader"]
                    .iter()
                    .map(move |leaf| format!("/bus/{:02}/{}", n, leaf))
                    .collect::<Vec<_>>()
            })
            .collect(),
    }
}

fn matrix_section() -> ManifestSection {
    ManifestSection {
        label: "matrices".to_string(),
        addresses: (1..=6)
            .flat_map(|n| {
                ["config/name", "mix/on", "mix/fader"]
                    .iter()
                    .map(move |leaf| format!("/mtx/{:02}/{}", n, leaf))
                    .collect::<Vec<_>>()
            })
            .collect(),
    }
}

fn main_section() -> ManifestSection {
    ManifestSection {
        label: "main outputs".to_string(),
        addresses: vec![
            "/main/st/mix/on".to_string(),
            "/main/st/mix/fader".to_string(),
            "/main/st/mix/pan".to_string(),
            "/main/m/mix/on".to_string(),
            "/main/m/mix/fader".to_string(),
        ],
    }
}

fn dca_section() -> ManifestSection {
    ManifestSection {
        label: "dca groups".to_string(),
        addresses: (1..=8)
            .flat_map(|n| {
                ["config/name", "on", "fader"]
                    .iter()
                    .map(move |leaf| format!("/dca/{}/{}", n, leaf))
                    .collect::<Vec<_>>()
            })
            .collect(),
    }
}

fn effects_section() -> ManifestSection {
    ManifestSection {
        label: "effects".to_string(),
        addresses: (1..=8).map(|n| format!("/fx/{}/type", n)).collect(),
    }
}

fn routing_section() -> ManifestSection {
    ManifestSection {
        label: "routing".to_string(),
        addresses: ["1-8", "9-16", "17-24", "25-32", "AUX"]
            .iter()
            .map(|block| format!("/config/routing/IN/{}", block))
            .collect(),
    }
}

fn output_section() -> ManifestSection {
    ManifestSection {
        label: "output patching".to_string(),
        addresses: (1..=16)
            .map(|n| format!("/outputs/main/{:02}/src", n))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn scene_manifest_shape() {
        let manifest = Manifest::scene();
        // 45 per channel strip plus the shared sections.
        assert_eq!(manifest.sections()[0].addresses.len(), 45);
        assert!(manifest.len() > 1500 && manifest.len() < 1800, "{}", manifest.len());

        let unique: HashSet<_> = manifest.entries().map(|(_, a)| a.to_string()).collect();
        assert_eq!(unique.len(), manifest.len(), "duplicate addresses");
    }

    #[test]
    fn full_backup_adds_slots_libraries_and_state() {
        let scene = Manifest::scene();
        let full = Manifest::full_backup();
        // 200 scene headers + 200 snippet headers + 300 presets + 4 state.
        assert_eq!(full.len(), scene.len() + 704);

        let labels: Vec<_> = full.sections().iter().map(|s| s.label.as_str()).collect();
        assert!(labels.contains(&"scene headers"));
        assert!(labels.contains(&"snippet headers"));
        assert!(labels.contains(&"library presets"));
        assert!(labels.contains(&"console state"));
    }

    #[test]
    fn slot_addresses_are_zero_padded() {
        assert_eq!(scene_slot_name(0), "/-show/showfile/scene/000/name");
        assert_eq!(scene_slot_notes(99), "/-show/showfile/scene/099/notes");
        assert_eq!(snippet_slot_name(7), "/-show/showfile/snippet/007/name");
    }

    #[test]
    fn section_labels_match_addresses() {
        assert_eq!(section_label_for("/ch/12/mix/fader"), "channel strip 12");
        assert_eq!(section_label_for("/bus/03/mix/on"), "bus masters");
        assert_eq!(
            section_label_for("/-show/showfile/snippet/004/name"),
            "snippet headers"
        );
        assert_eq!(section_label_for("/-show/prepos/current"), "console state");
        assert_eq!(section_label_for("/config/routing/IN/1-8"), "routing");
        assert_eq!(section_label_for("/somewhere/else"), "parameters");
    }

    #[test]
    fn entries_follow_section_order() {
        let manifest = Manifest::scene();
        let first: Vec<_> = manifest.entries().take(2).collect();
        assert_eq!(first[0], ("channel strip 01", "/ch/01/config/name"));
        assert_eq!(first[1], ("channel strip 01", "/ch/01/config/color"));
    }
}
