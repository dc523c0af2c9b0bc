// ============================================================================
// tests/integration_test.rs - コーデック探索からパスプログラミングまでの結合テスト
// ============================================================================
//!
//! `VerbTransport` を実装する固定応答のフェイクトランスポートを使い、
//! ウィジェットグラフ構築 → パス探索 → パス設定 → 音量調整までの
//! 一連の流れをクレートの公開APIのみを通して検証する。

use std::cell::RefCell;
use std::collections::BTreeMap;

use ihda::{Codec, HdaResult, PcmFormat, VerbTransport};

const VERB_GET_PARAM: u32 = 0xF0000;
const VERB_GET_CONN_LIST: u32 = 0xF0200;
const VERB_GET_CONFIG_DEFAULT: u32 = 0xF1C00;
const VERB_SET_CONV_FMT_CMD: u32 = 0x20000;

const PARAM_VENDOR_ID: u32 = 0x00;
const PARAM_SUB_NODE_COUNT: u32 = 0x04;
const PARAM_FUNC_GROUP_TYPE: u32 = 0x05;
const PARAM_WIDGET_CAPS: u32 = 0x09;
const PARAM_PIN_CAPS: u32 = 0x0C;
const PARAM_IN_AMP_CAPS: u32 = 0x0D;
const PARAM_CONN_LIST_LEN: u32 = 0x0E;
const PARAM_OUT_AMP_CAPS: u32 = 0x12;

const CONFIG_DEFAULT_ASSOC_SHIFT: u32 = 4;
const PIN_CAPS_OUTPUT_CAPABLE: u32 = 1 << 4;
const AMP_CAPS_MUTE_CAPABLE: u32 = 1 << 31;

struct FakeTransport {
    responses: RefCell<BTreeMap<(u8, u32), u32>>,
    log: RefCell<Vec<(u8, u32)>>,
}

impl FakeTransport {
    fn new() -> Self {
        Self {
            responses: RefCell::new(BTreeMap::new()),
            log: RefCell::new(Vec::new()),
        }
    }

    fn set(&self, nid: u8, verb: u32, response: u32) {
        self.responses.borrow_mut().insert((nid, verb), response);
    }
}

impl VerbTransport for FakeTransport {
    fn send_command(&self, _codec_addr: u8, nid: u8, verb: u32) -> HdaResult<u32> {
        self.log.borrow_mut().push((nid, verb));
        Ok(*self.responses.borrow().get(&(nid, verb)).unwrap_or(&0))
    }

    fn delay_us(&self, _microseconds: u32) {}
}

/// ピン(0x10) -> ミキサー(0x11) -> DAC(0x12) の単純なトポロジーを応答テーブルへ仕込む。
fn build_single_path_codec() -> (FakeTransport, Codec) {
    let t = FakeTransport::new();

    // nid 0 (root): ベンダーID、ファンクショングループ1個 (nid 1)
    t.set(0, VERB_GET_PARAM | PARAM_VENDOR_ID, (0x8086u32 << 16) | 0x1234);
    t.set(0, VERB_GET_PARAM | PARAM_SUB_NODE_COUNT, (1u32 << 16) | 1);

    // nid 1 (function group): オーディオ (type=1)、サブノード 0x10..=0x12
    t.set(1, VERB_GET_PARAM | PARAM_FUNC_GROUP_TYPE, 0x01);
    t.set(1, VERB_GET_PARAM | PARAM_SUB_NODE_COUNT, (0x10u32 << 16) | 3);

    // nid 0x10: ピンコンプレックス、出力可能、association=1・connectivity=0(接続)、0x11へ接続
    t.set(
        0x10,
        VERB_GET_PARAM | PARAM_WIDGET_CAPS,
        (0x04u32 << 20) | (1 << 8),
    );
    t.set(0x10, VERB_GET_PARAM | PARAM_IN_AMP_CAPS, 0);
    t.set(0x10, VERB_GET_PARAM | PARAM_OUT_AMP_CAPS, AMP_CAPS_MUTE_CAPABLE | 0x7F);
    t.set(0x10, VERB_GET_PARAM | PARAM_PIN_CAPS, PIN_CAPS_OUTPUT_CAPABLE);
    t.set(0x10, VERB_GET_PARAM | PARAM_CONN_LIST_LEN, 1);
    t.set(0x10, VERB_GET_CONN_LIST, 0x11);
    t.set(0x10, VERB_GET_CONFIG_DEFAULT, 1u32 << CONFIG_DEFAULT_ASSOC_SHIFT);

    // nid 0x11: オーディオミキサー、0x12へ接続
    t.set(
        0x11,
        VERB_GET_PARAM | PARAM_WIDGET_CAPS,
        (0x02u32 << 20) | (1 << 8),
    );
    t.set(0x11, VERB_GET_PARAM | PARAM_IN_AMP_CAPS, 0);
    t.set(0x11, VERB_GET_PARAM | PARAM_OUT_AMP_CAPS, 0x7F);
    t.set(0x11, VERB_GET_PARAM | PARAM_CONN_LIST_LEN, 1);
    t.set(0x11, VERB_GET_CONN_LIST, 0x12);

    // nid 0x12: オーディオ出力 (DAC)
    t.set(0x12, VERB_GET_PARAM | PARAM_WIDGET_CAPS, 0x00u32 << 20);
    t.set(0x12, VERB_GET_PARAM | PARAM_IN_AMP_CAPS, 0);
    t.set(0x12, VERB_GET_PARAM | PARAM_OUT_AMP_CAPS, 0x7F);

    let mut codec =
        Codec::discover(&t, 0).expect("codec discovery should succeed against a well-formed fake");
    codec.compute_output_paths();
    (t, codec)
}

#[test]
fn discovers_widgets_and_finds_output_path() {
    let (_t, codec) = build_single_path_codec();

    assert!(codec.widget(0x10).is_some());
    assert!(codec.widget(0x11).is_some());
    assert!(codec.widget(0x12).is_some());
    assert_eq!(codec.output_paths.len(), 1);

    let path = &codec.output_paths[0];
    assert_eq!(path.pin_nid(), 0x10);
    assert_eq!(path.dac_nid(), 0x12);
    assert_eq!(path.nids, vec![0x10, 0x11, 0x12]);
}

#[test]
fn programs_path_and_adjusts_volume() {
    let (t, codec) = build_single_path_codec();
    let mut path = codec.output_paths[0].clone();

    let format = PcmFormat::new(48000, 2, 16);
    ihda::path_setup(&t, &codec, &path, 0, format).expect("path setup should succeed");

    // DACへフォーマット設定verbが送られたことを確認する
    assert!(t
        .log
        .borrow()
        .iter()
        .any(|&(nid, verb)| nid == 0x12 && verb & 0xF0000 == VERB_SET_CONV_FMT_CMD));

    ihda::set_volume(&t, &codec, &mut path, 50).expect("set_volume should succeed");
    assert!(path.current_gain > 0 && path.current_gain <= 0x7F);

    ihda::set_volume(&t, &codec, &mut path, 100).expect("set_volume should succeed at 100%");
    assert_eq!(path.current_gain, 0x7F);

    ihda::path_shutdown(&t, &codec, &path).expect("path shutdown should succeed");
}
