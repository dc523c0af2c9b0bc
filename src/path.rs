// ============================================================================
// src/path.rs - パスファインダー
// ============================================================================
//!
//! ピンコンプレックスからオーディオ出力コンバータへ至る経路を
//! 反復的な深さ優先探索で列挙し、同時使用可能性を判定する。

use alloc::vec::Vec;

use crate::codec::Codec;
use crate::error::{HdaError, HdaResult};
use crate::widget::WidgetType;

const MAX_PATH_DEPTH: usize = 20;

/// ピンからDACへ至る、ウィジェットNIDの並び（traversal順）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    pub nids: Vec<u8>,
    /// 直近に `program::set_volume` で書き込んだゲイン段 (0..=max_step)。
    pub current_gain: u8,
}

impl Path {
    pub fn pin_nid(&self) -> u8 {
        self.nids[0]
    }

    pub fn dac_nid(&self) -> u8 {
        *self.nids.last().unwrap()
    }
}

struct StackEntry {
    widget: u8,
    /// レンジ展開済み接続先の走査カーソル
    cursor: usize,
}

/// コーデックの全出力可能ピンについて、DACへ至る全パスを列挙する。
pub fn find_output_paths(codec: &Codec) -> Vec<Path> {
    let mut paths = Vec::new();
    for &pin_nid in &codec.pin_nodes {
        let Some(pin) = codec.widget(pin_nid) else { continue };
        if !pin.is_output_capable_pin() || !pin.is_physically_connected() {
            continue;
        }
        paths.extend(find_paths_from(codec, pin_nid));
    }
    paths
}

/// 単一ピンを起点に、接続リストを辿る反復DFSで全パスを見つける。
fn find_paths_from(codec: &Codec, start_nid: u8) -> Vec<Path> {
    let mut results = Vec::new();
    let mut stack: Vec<(u8, Vec<u8>, usize)> = Vec::new(); // (widget, expanded_conns, cursor)

    let Some(start_widget) = codec.widget(start_nid) else { return results };
    stack.push((start_nid, start_widget.expand_connections(), 0));
    let mut path_nids: Vec<u8> = alloc::vec![start_nid];

    while let Some((widget_nid, conns, cursor)) = stack.last_mut() {
        if *cursor >= conns.len() {
            stack.pop();
            path_nids.pop();
            continue;
        }

        let neighbor_nid = conns[*cursor];
        *cursor += 1;
        let widget_nid = *widget_nid;

        let Some(neighbor) = codec.widget(neighbor_nid) else {
            log::warn!(
                "widget {:#x}: connection to unknown nid {:#x}",
                widget_nid, neighbor_nid
            );
            continue;
        };

        if matches!(neighbor.widget_type, WidgetType::AudioOutput) {
            let mut nids = path_nids.clone();
            nids.push(neighbor_nid);
            results.push(Path { nids, current_gain: 0 });
            continue;
        }

        if path_nids.contains(&neighbor_nid) {
            continue; // cycle
        }
        if stack.len() >= MAX_PATH_DEPTH {
            continue;
        }

        path_nids.push(neighbor_nid);
        stack.push((neighbor_nid, neighbor.expand_connections(), 0));
    }

    results
}

/// 2つのパスが、インデックス `i-1` (i >= 1, ピン自身を除く) の位置で
/// 同じウィジェットを共有しているかを調べる。
fn shares_non_pin_widget(a: &Path, b: &Path) -> bool {
    for i in 1..a.nids.len() {
        for j in 1..b.nids.len() {
            if i == j && a.nids[i] == b.nids[i] {
                return true;
            }
        }
    }
    false
}

/// 2つのパスが同時に使用可能かどうか。ピン以外のウィジェットの共有は
/// `same_stream` が真で、かつ同じ相対位置での共有に限り許容される。
pub fn paths_usable_simultaneously(a: &Path, b: &Path, same_stream: bool) -> bool {
    if !shares_non_pin_widget(a, b) {
        return true;
    }
    same_stream
}

/// 指定ピンへのパスのうち、`existing` 全てと同時使用可能な最初のものを返す。
pub fn find_path(
    codec: &Codec,
    pin_nid: u8,
    existing: &[&Path],
    same_stream: bool,
) -> HdaResult<Path> {
    codec
        .output_paths
        .iter()
        .find(|candidate| {
            candidate.pin_nid() == pin_nid
                && existing
                    .iter()
                    .all(|e| paths_usable_simultaneously(candidate, e, same_stream))
        })
        .cloned()
        .ok_or(HdaError::Unsupported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::*;
    use crate::widget::{AmpCaps, Widget};
    use alloc::collections::BTreeMap;

    fn pin(nid: u8, conns: &[u8]) -> Widget {
        Widget {
            nid,
            widget_type: WidgetType::PinComplex,
            connections_raw: conns.to_vec(),
            in_amp_caps: AmpCaps(0),
            out_amp_caps: AmpCaps(AMP_CAPS_MUTE_CAPABLE | 0x7F),
            pin_caps: PIN_CAPS_OUTPUT_CAPABLE,
            config_default: (1u32 << CONFIG_DEFAULT_ASSOC_SHIFT),
        }
    }

    fn mixer(nid: u8, conns: &[u8]) -> Widget {
        Widget {
            nid,
            widget_type: WidgetType::AudioMixer,
            connections_raw: conns.to_vec(),
            in_amp_caps: AmpCaps(0),
            out_amp_caps: AmpCaps(0x7F),
            pin_caps: 0,
            config_default: 0,
        }
    }

    fn dac(nid: u8) -> Widget {
        Widget {
            nid,
            widget_type: WidgetType::AudioOutput,
            connections_raw: Vec::new(),
            in_amp_caps: AmpCaps(0),
            out_amp_caps: AmpCaps(0x7F),
            pin_caps: 0,
            config_default: 0,
        }
    }

    fn build_codec(widgets: Vec<Widget>, pins: Vec<u8>) -> Codec {
        let mut map = BTreeMap::new();
        for w in widgets {
            map.insert(w.nid, w);
        }
        Codec {
            address: 0,
            vendor_id: 0,
            device_id: 0,
            widgets: map,
            dac_nodes: Vec::new(),
            pin_nodes: pins,
            output_groups: Vec::new(),
            output_paths: Vec::new(),
        }
    }

    #[test]
    fn test_simple_path_pin_mixer_dac() {
        let codec = build_codec(
            alloc::vec![pin(0x10, &[0x11]), mixer(0x11, &[0x12]), dac(0x12)],
            alloc::vec![0x10],
        );
        let paths = find_output_paths(&codec);
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].nids, alloc::vec![0x10, 0x11, 0x12]);
    }

    #[test]
    fn test_shared_widget_requires_same_stream() {
        let p1 = Path { nids: alloc::vec![0x10, 0x11, 0x12], current_gain: 0 };
        let p2 = Path { nids: alloc::vec![0x13, 0x11, 0x14], current_gain: 0 };
        assert!(!paths_usable_simultaneously(&p1, &p2, false));
        assert!(paths_usable_simultaneously(&p1, &p2, true));
    }

    #[test]
    fn test_disjoint_paths_always_usable() {
        let p1 = Path { nids: alloc::vec![0x10, 0x11, 0x12], current_gain: 0 };
        let p2 = Path { nids: alloc::vec![0x13, 0x15, 0x16], current_gain: 0 };
        assert!(paths_usable_simultaneously(&p1, &p2, false));
    }

    #[test]
    fn test_cycle_avoided() {
        let codec = build_codec(
            alloc::vec![
                pin(0x10, &[0x11]),
                mixer(0x11, &[0x12, 0x10]),
                dac(0x12),
            ],
            alloc::vec![0x10],
        );
        let paths = find_output_paths(&codec);
        assert_eq!(paths.len(), 1);
    }
}
