// ============================================================================
// src/program.rs - パスプログラマー
// ============================================================================
//!
//! Pathに沿ってフォーマット/アンプ/セレクタ/ピンコントロールを設定する。

use crate::codec::{Codec, VerbTransport};
use crate::error::HdaResult;
use crate::format::PcmFormat;
use crate::path::Path;
use crate::regs::*;
use crate::widget::WidgetType;

/// `0.01` を16.16固定小数点で近似した定数 (`0.01 * 65536` を切り捨て)。
const ONE_PERCENTAGE: u32 = 655;

fn amp_write(output: bool, left: bool, right: bool, mute: bool, step: u8) -> u32 {
    let mut v: u16 = step as u16 & AMP_GAIN_MASK;
    if mute {
        v |= AMP_MUTE;
    }
    if output {
        v |= AMP_SET_OUTPUT;
    } else {
        v |= AMP_SET_INPUT;
    }
    if left {
        v |= AMP_LEFT;
    }
    if right {
        v |= AMP_RIGHT;
    }
    v as u32
}

/// ピンからDACまで順にフォーマット/セレクタ/パワー/アンプを設定する。
pub fn path_setup<T: VerbTransport + ?Sized>(
    t: &T,
    codec: &Codec,
    path: &Path,
    stream_index: u8,
    format: PcmFormat,
) -> HdaResult<()> {
    let dac_nid = path.dac_nid();

    // 1. コンバータにフォーマットを設定
    t.send_command(codec.address, dac_nid, VERB_SET_CONV_FMT | format.encode() as u32)?;
    let channels = format.channels.max(1) - 1;
    t.send_command(codec.address, dac_nid, VERB_SET_CHANNEL_COUNT | channels as u32)?;

    // 2. 内部ホップのセレクタ設定
    for i in 0..path.nids.len().saturating_sub(1) {
        let nid = path.nids[i];
        let next = path.nids[i + 1];
        let Some(widget) = codec.widget(nid) else { continue };
        let conns = widget.expand_connections();
        if conns.len() > 1 {
            if let Some(idx) = conns.iter().position(|&c| c == next) {
                t.send_command(codec.address, nid, VERB_SET_CONN_SEL | idx as u32)?;
            }
        }
    }

    // 3. 全ウィジェットをD0へ
    for &nid in &path.nids {
        t.send_command(codec.address, nid, VERB_SET_POWER | POWER_D0 as u32)?;
    }

    // 4. ピンコンプレックスの設定
    let pin_nid = path.pin_nid();
    if let Some(pin) = codec.widget(pin_nid) {
        if pin.eapd_capable() {
            t.send_command(codec.address, pin_nid, VERB_SET_EAPD | EAPD_EAPD as u32)?;
        }
        let step = pin.out_amp_caps.step_size();
        t.send_command(
            codec.address,
            pin_nid,
            VERB_SET_AMP_GAIN | amp_write(true, true, true, false, step),
        )?;
        let pin_ctl = (PIN_CTL_HP_EN | PIN_CTL_OUT_EN) as u32;
        t.send_command(codec.address, pin_nid, VERB_SET_PIN_CTL | pin_ctl)?;
    }

    // 5. ミキサーのアンマット/フルゲイン
    for &nid in &path.nids[1..path.nids.len() - 1] {
        let Some(widget) = codec.widget(nid) else { continue };
        if matches!(widget.widget_type, WidgetType::AudioMixer) {
            let step = widget.out_amp_caps.step_size();
            t.send_command(
                codec.address,
                nid,
                VERB_SET_AMP_GAIN | amp_write(true, true, true, false, step),
            )?;
        }
    }

    // 6. DACのストリームタグ/チャンネルとハーフゲイン
    let stream_control = (((stream_index + 1) as u32) << CONV_STREAM_SHIFT) & CONV_STREAM_MASK as u32;
    t.send_command(codec.address, dac_nid, VERB_SET_CONV_STREAM | stream_control)?;

    if let Some(dac) = codec.widget(dac_nid) {
        let step = dac.out_amp_caps.step_size() / 2;
        t.send_command(
            codec.address,
            dac_nid,
            VERB_SET_AMP_GAIN | amp_write(true, true, true, false, step),
        )?;
    }

    Ok(())
}

/// `path_setup` の逆順の停止処理。
pub fn path_shutdown<T: VerbTransport + ?Sized>(t: &T, codec: &Codec, path: &Path) -> HdaResult<()> {
    let pin_nid = path.pin_nid();
    if let Some(pin) = codec.widget(pin_nid) {
        let step = pin.out_amp_caps.step_size();
        t.send_command(
            codec.address,
            pin_nid,
            VERB_SET_AMP_GAIN | amp_write(true, true, true, true, step),
        )?;
        t.send_command(codec.address, pin_nid, VERB_SET_PIN_CTL | 0)?;
    }

    for &nid in &path.nids[1..path.nids.len() - 1] {
        let Some(widget) = codec.widget(nid) else { continue };
        if matches!(widget.widget_type, WidgetType::AudioMixer) {
            let step = widget.out_amp_caps.step_size();
            t.send_command(
                codec.address,
                nid,
                VERB_SET_AMP_GAIN | amp_write(true, true, true, true, step),
            )?;
        }
    }

    let dac_nid = path.dac_nid();
    t.send_command(codec.address, dac_nid, VERB_SET_CONV_STREAM | 0)?;

    Ok(())
}

/// パスのDACかピンのどちらを対象に音量/ミュートを操作するかを選ぶ。
/// ピンがミュート対応ならピン、そうでなければDAC (コンバータ) を対象とする。
fn volume_target(codec: &Codec, path: &Path) -> u8 {
    if let Some(pin) = codec.widget(path.pin_nid()) {
        if pin.out_amp_caps.mute_capable() {
            return path.pin_nid();
        }
    }
    path.dac_nid()
}

/// `volume` (0..=100) を16.16固定小数点で段数へ変換し、対象ウィジェットへ書き込む。
pub fn set_volume<T: VerbTransport + ?Sized>(
    t: &T,
    codec: &Codec,
    path: &mut Path,
    volume: u8,
) -> HdaResult<()> {
    let volume = volume.min(100);
    let target = volume_target(codec, path);
    let Some(widget) = codec.widget(target) else { return Ok(()) };
    let max_value = widget.out_amp_caps.step_size();

    let step = if volume == 100 {
        max_value
    } else {
        let converted_max = (max_value as u64) << 16;
        let multiplier = ONE_PERCENTAGE as u64 * volume as u64;
        let result = (multiplier * converted_max) >> 16;
        (result >> 16) as u8
    };

    path.current_gain = step;
    t.send_command(
        codec.address,
        target,
        VERB_SET_AMP_GAIN | amp_write(true, true, true, false, step),
    )?;
    Ok(())
}

/// 対象ウィジェットのミュートビットを切り替える。段数は保持する。
pub fn set_mute<T: VerbTransport + ?Sized>(
    t: &T,
    codec: &Codec,
    path: &Path,
    mute: bool,
) -> HdaResult<()> {
    let target = volume_target(codec, path);
    t.send_command(
        codec.address,
        target,
        VERB_SET_AMP_GAIN | amp_write(true, true, true, mute, path.current_gain),
    )?;
    Ok(())
}
