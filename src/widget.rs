// ============================================================================
// src/widget.rs - ウィジェットグラフの構成要素
// ============================================================================
//!
//! Widget / NodeType / 接続リストのレンジ展開、出力グループの構成。

use alloc::vec::Vec;

use crate::regs::*;

/// ウィジェット種別 (AFG_CAPS/WIDGET_CAPS ビット 20..23)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WidgetType {
    AudioOutput,
    AudioInput,
    AudioMixer,
    AudioSelector,
    PinComplex,
    PowerWidget,
    VolumeKnob,
    BeepGenerator,
    VendorDefined,
    Unknown(u8),
}

impl From<u8> for WidgetType {
    fn from(v: u8) -> Self {
        match v {
            WIDGET_TYPE_AUDIO_OUTPUT => WidgetType::AudioOutput,
            WIDGET_TYPE_AUDIO_INPUT => WidgetType::AudioInput,
            WIDGET_TYPE_AUDIO_MIXER => WidgetType::AudioMixer,
            WIDGET_TYPE_AUDIO_SELECTOR => WidgetType::AudioSelector,
            WIDGET_TYPE_PIN_COMPLEX => WidgetType::PinComplex,
            WIDGET_TYPE_POWER => WidgetType::PowerWidget,
            WIDGET_TYPE_VOLUME_KNOB => WidgetType::VolumeKnob,
            WIDGET_TYPE_BEEP_GEN => WidgetType::BeepGenerator,
            WIDGET_TYPE_VENDOR => WidgetType::VendorDefined,
            other => WidgetType::Unknown(other),
        }
    }
}

/// 振幅アンプのケーパビリティ (IN_AMP_CAPS/OUT_AMP_CAPS の生ワード)
#[derive(Debug, Clone, Copy, Default)]
pub struct AmpCaps(pub u32);

impl AmpCaps {
    pub fn step_size(&self) -> u8 {
        (self.0 & AMP_CAPS_STEP_SIZE_MASK) as u8
    }

    pub fn mute_capable(&self) -> bool {
        self.0 & AMP_CAPS_MUTE_CAPABLE != 0
    }
}

/// 既定デバイス (CONFIG_DEFAULT ビット 20..23)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultDevice {
    LineOut,
    Speaker,
    HeadphoneOut,
    Other(u8),
}

impl DefaultDevice {
    fn from_code(code: u8) -> Self {
        match code {
            DEFAULT_DEVICE_LINE_OUT => DefaultDevice::LineOut,
            DEFAULT_DEVICE_SPEAKER => DefaultDevice::Speaker,
            DEFAULT_DEVICE_HP_OUT => DefaultDevice::HeadphoneOut,
            other => DefaultDevice::Other(other),
        }
    }
}

/// 発見された単一のウィジェット。発見後は不変。
#[derive(Debug, Clone)]
pub struct Widget {
    pub nid: u8,
    pub widget_type: WidgetType,
    /// 接続リストの生バイト列（レンジ展開前）。
    pub connections_raw: Vec<u8>,
    pub in_amp_caps: AmpCaps,
    pub out_amp_caps: AmpCaps,
    pub pin_caps: u32,
    pub config_default: u32,
}

impl Widget {
    pub fn is_output_capable_pin(&self) -> bool {
        matches!(self.widget_type, WidgetType::PinComplex)
            && self.pin_caps & PIN_CAPS_OUTPUT_CAPABLE != 0
    }

    pub fn eapd_capable(&self) -> bool {
        self.pin_caps & PIN_CAPS_EAPD_CAPABLE != 0
    }

    /// `CONFIG_DEFAULT` の接続性フィールド。1 は「未接続」を意味する。
    pub fn connectivity(&self) -> u8 {
        ((self.config_default & CONFIG_DEFAULT_CONN_MASK) >> CONFIG_DEFAULT_CONN_SHIFT) as u8
    }

    pub fn is_physically_connected(&self) -> bool {
        self.connectivity() != 1
    }

    pub fn association(&self) -> u8 {
        ((self.config_default & CONFIG_DEFAULT_ASSOC_MASK) >> CONFIG_DEFAULT_ASSOC_SHIFT) as u8
    }

    pub fn sequence(&self) -> u8 {
        (self.config_default & CONFIG_DEFAULT_SEQ_MASK) as u8
    }

    /// デフォルトデバイスの分類。ライン出力で固定内蔵接続 (2 または 3) の場合は
    /// スピーカーへ補正する。
    pub fn default_device(&self) -> DefaultDevice {
        let raw = ((self.config_default & CONFIG_DEFAULT_DEVICE_MASK)
            >> CONFIG_DEFAULT_DEVICE_SHIFT) as u8;
        let dev = DefaultDevice::from_code(raw);
        let conn = self.connectivity();
        if matches!(dev, DefaultDevice::LineOut) && (conn == 2 || conn == 3) {
            DefaultDevice::Speaker
        } else {
            dev
        }
    }

    /// 接続リストをレンジ展開した NID の並びを返す。
    ///
    /// バイトの bit7 が立っていればレンジ終端を意味し、
    /// 直前のバイト（下位7ビット）を開始点として start..=end を展開する。
    /// 先頭エントリがレンジ終端の場合は警告し、通常エントリとして扱う。
    pub fn expand_connections(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut prev: Option<u8> = None;

        for (i, &raw) in self.connections_raw.iter().enumerate() {
            let is_range_end = raw & 0x80 != 0;
            let value = raw & 0x7F;

            if is_range_end && i == 0 {
                log::warn!(
                    "widget {:#x}: connection list starts with a range marker, treating as ordinary entry",
                    self.nid
                );
                out.push(value);
                prev = Some(value);
                continue;
            }

            if is_range_end {
                let start = prev.unwrap_or(value);
                if start <= value {
                    // start 自体は直前の通常エントリで既に push 済みなので、
                    // start+1 から end までを追加する。
                    for nid in (start + 1)..=value {
                        out.push(nid);
                    }
                } else {
                    log::warn!(
                        "widget {:#x}: malformed connection range {}..{}",
                        self.nid, start, value
                    );
                }
            } else {
                out.push(value);
            }
            prev = Some(value);
        }
        out
    }
}

/// 物理ジャック/スピーカーとして機能するピンコンプレックス。
#[derive(Debug, Clone, Copy)]
pub struct Output {
    pub pin_nid: u8,
    pub sequence: u8,
}

/// アソシエーションタグでまとめられた出力グループ。
#[derive(Debug, Clone)]
pub struct OutputGroup {
    pub association: u8,
    pub outputs: Vec<Output>,
}

impl OutputGroup {
    /// 挿入ソートで `sequence` 昇順を保ったまま出力を追加する。
    pub fn insert_sorted(&mut self, output: Output) {
        let pos = self
            .outputs
            .iter()
            .position(|o| o.sequence > output.sequence)
            .unwrap_or(self.outputs.len());
        self.outputs.insert(pos, output);
    }
}

/// 発見済みウィジェットの集合からアソシエーション 0 を除いた
/// 出力グループを構築する。アソシエーション15は各出力を独立したグループにする。
pub fn build_output_groups(widgets: &[Widget]) -> Vec<OutputGroup> {
    let mut groups: Vec<OutputGroup> = Vec::new();

    for w in widgets {
        if !w.is_output_capable_pin() || !w.is_physically_connected() {
            continue;
        }
        let assoc = w.association();
        if assoc == 0 {
            continue;
        }
        let output = Output {
            pin_nid: w.nid,
            sequence: w.sequence(),
        };

        if assoc == 15 {
            groups.push(OutputGroup {
                association: 15,
                outputs: alloc::vec![output],
            });
            continue;
        }

        match groups.iter_mut().find(|g| g.association == assoc) {
            Some(g) => g.insert_sorted(output),
            None => {
                let mut g = OutputGroup {
                    association: assoc,
                    outputs: Vec::new(),
                };
                g.insert_sorted(output);
                // groups のソート順 (assoc 昇順) を保つ
                let pos = groups
                    .iter()
                    .position(|existing| existing.association > assoc)
                    .unwrap_or(groups.len());
                groups.insert(pos, g);
            }
        }
    }

    groups
}
