//! Paged per-layer move extraction for preview rendering
//!
//! A page request streams the file once, tracking full motion state the
//! whole way (a window cannot be parsed in isolation: positioning modes and
//! the current position depend on everything before it), but only layers
//! inside the requested window retain their moves. Dense layers are
//! decimated for preview payloads.

use super::{is_layer_marker, parse_tool_select, strip_inline_comment, MotionState};
use serde::Serialize;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use tracing::debug;

/// Default decimation: keep 1 in every 100 moves of a layer
pub const DEFAULT_DECIMATION: usize = 100;

/// Extrusion or travel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MoveKind {
    /// Material is being deposited
    Extrude,
    /// Head repositioning without extrusion
    Travel,
}

/// One XY move within a layer
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Move {
    /// Move classification
    pub kind: MoveKind,
    /// Start position (x, y)
    pub from: [f64; 2],
    /// End position (x, y)
    pub to: [f64; 2],
    /// Active tool when the move was made (0-based)
    pub tool: u8,
}

/// Moves of one layer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Layer {
    /// 0-based layer index
    pub index: usize,
    /// Z height of the layer
    pub z: f64,
    /// Decimated moves in document order
    pub moves: Vec<Move>,
}

/// One page of layers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerPage {
    /// Total layers in the document
    pub total_layers: usize,
    /// First layer index of this page
    pub start: usize,
    /// Layers in the window, in order
    pub layers: Vec<Layer>,
}

/// Streams G-code into paged per-layer move records
#[derive(Debug, Clone)]
pub struct LayerReader {
    decimation: usize,
}

impl Default for LayerReader {
    fn default() -> Self {
        LayerReader {
            decimation: DEFAULT_DECIMATION,
        }
    }
}

impl LayerReader {
    /// Reader with the default preview decimation
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep 1 in every `factor` moves per layer; `1` keeps everything
    pub fn with_decimation(mut self, factor: usize) -> Self {
        self.decimation = factor.max(1);
        self
    }

    /// Extract a window of `count` layers starting at `start` (0-based)
    ///
    /// Restartable: any window can be requested against the same file.
    /// A document with no known layer marker yields zero layers.
    pub fn extract(
        &self,
        reader: impl BufRead,
        start: usize,
        count: usize,
    ) -> io::Result<LayerPage> {
        let end = start.saturating_add(count);
        let mut state = MotionState::default();
        let mut current_layer: Option<usize> = None;
        let mut pending_z = false;
        let mut tool = 0u8;
        let mut move_counter = 0usize;
        let mut total_layers = 0usize;
        let mut layers: Vec<Layer> = Vec::new();

        for line in reader.lines() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            if is_layer_marker(trimmed) {
                let index = total_layers;
                total_layers += 1;
                current_layer = Some(index);
                pending_z = true;
                if index >= start && index < end {
                    layers.push(Layer {
                        index,
                        z: state.z,
                        moves: Vec::new(),
                    });
                }
                continue;
            }
            if trimmed.starts_with(';') {
                continue;
            }

            let code = strip_inline_comment(trimmed);
            if code.is_empty() {
                continue;
            }

            if let Some(selected) = parse_tool_select(code) {
                tool = selected;
                continue;
            }

            let Some(applied) = state.apply(code) else {
                continue;
            };

            let Some(layer_index) = current_layer else {
                continue;
            };

            if applied.has_z && pending_z {
                if let Some(layer) = layers.last_mut() {
                    if layer.index == layer_index {
                        layer.z = state.z;
                    }
                }
                pending_z = false;
            }

            // Pure Z-hops and retractions carry no XY change.
            if !applied.has_x && !applied.has_y {
                continue;
            }
            let to = [state.x, state.y];
            if (to[0] - applied.from[0]).abs() < 1e-3 && (to[1] - applied.from[1]).abs() < 1e-3 {
                continue;
            }

            if layer_index < start || layer_index >= end {
                continue;
            }

            move_counter += 1;
            let layer = match layers.last_mut() {
                Some(layer) if layer.index == layer_index => layer,
                _ => continue,
            };
            // Always keep a layer's first move so every layer renders.
            if layer.moves.is_empty() || move_counter % self.decimation == 0 {
                layer.moves.push(Move {
                    kind: if applied.extruding {
                        MoveKind::Extrude
                    } else {
                        MoveKind::Travel
                    },
                    from: applied.from,
                    to,
                    tool,
                });
            }
        }

        debug!(
            total_layers,
            start,
            returned = layers.len(),
            "extracted layer page"
        );
        Ok(LayerPage {
            total_layers,
            start,
            layers,
        })
    }

    /// Extract a window from a file on disk
    pub fn extract_path(
        &self,
        path: impl AsRef<Path>,
        start: usize,
        count: usize,
    ) -> io::Result<LayerPage> {
        self.extract(BufReader::new(std::fs::File::open(path)?), start, count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample(layers: usize, moves_per_layer: usize) -> String {
        let mut out = String::from("G90\nM83\n");
        for layer in 0..layers {
            out.push_str(";LAYER_CHANGE\n");
            out.push_str(&format!("G1 Z{:.1}\n", (layer + 1) as f64 * 0.2));
            for m in 0..moves_per_layer {
                // Alternate extrusion and travel.
                if m % 2 == 0 {
                    out.push_str(&format!("G1 X{} Y{} E0.5\n", m + 1, layer));
                } else {
                    out.push_str(&format!("G0 X{} Y{}\n", m + 1, layer + 1));
                }
            }
        }
        out
    }

    #[test]
    fn window_returns_requested_layers_only() {
        let text = sample(5, 4);
        let page = LayerReader::new()
            .with_decimation(1)
            .extract(Cursor::new(text), 1, 2)
            .unwrap();
        assert_eq!(page.total_layers, 5);
        assert_eq!(page.start, 1);
        assert_eq!(page.layers.len(), 2);
        assert_eq!(page.layers[0].index, 1);
        assert_eq!(page.layers[1].index, 2);
        assert!((page.layers[0].z - 0.4).abs() < 1e-9);
    }

    #[test]
    fn extrude_and_travel_moves_are_distinguished() {
        let text = sample(1, 4);
        let page = LayerReader::new()
            .with_decimation(1)
            .extract(Cursor::new(text), 0, 1)
            .unwrap();
        let kinds: Vec<MoveKind> = page.layers[0].moves.iter().map(|m| m.kind).collect();
        assert_eq!(
            kinds,
            vec![
                MoveKind::Extrude,
                MoveKind::Travel,
                MoveKind::Extrude,
                MoveKind::Travel
            ]
        );
    }

    #[test]
    fn window_past_the_end_is_empty_but_reports_totals() {
        let text = sample(3, 2);
        let page = LayerReader::new()
            .extract(Cursor::new(text), 10, 5)
            .unwrap();
        assert_eq!(page.total_layers, 3);
        assert!(page.layers.is_empty());
    }

    #[test]
    fn no_markers_means_no_layers() {
        let text = "G90\nG1 Z0.2\nG1 X5 Y5 E1\n";
        let page = LayerReader::new().extract(Cursor::new(text), 0, 10).unwrap();
        assert_eq!(page.total_layers, 0);
        assert!(page.layers.is_empty());
    }

    #[test]
    fn decimation_keeps_the_first_move_of_each_layer() {
        let text = sample(2, 10);
        let page = LayerReader::new()
            .with_decimation(100)
            .extract(Cursor::new(text), 0, 2)
            .unwrap();
        for layer in &page.layers {
            assert!(!layer.moves.is_empty());
        }
    }

    #[test]
    fn active_tool_is_attached_to_moves() {
        let text = "\
G90
M83
;LAYER_CHANGE
G1 Z0.2
G1 X5 Y5 E1
T2
G1 X9 Y9 E1
";
        let page = LayerReader::new()
            .with_decimation(1)
            .extract(Cursor::new(text), 0, 1)
            .unwrap();
        let moves = &page.layers[0].moves;
        assert_eq!(moves[0].tool, 0);
        assert_eq!(moves[1].tool, 2);
    }

    #[test]
    fn paging_is_restartable() {
        let text = sample(4, 3);
        let reader = LayerReader::new().with_decimation(1);
        let first = reader.extract(Cursor::new(&text), 0, 2).unwrap();
        let second = reader.extract(Cursor::new(&text), 2, 2).unwrap();
        assert_eq!(first.layers.len(), 2);
        assert_eq!(second.layers.len(), 2);
        // The second window's state carries over from the unreturned prefix.
        assert!((second.layers[0].z - 0.6).abs() < 1e-9);
    }
}
