#![cfg_attr(not(test), no_std)]
//!
//! Intel HD Audio (HDA) コントローラ/コーデックドライバのコア。
//!
//! コントローラのライフサイクル管理、CORB/RIRB によるverb伝送、
//! コーデックのウィジェットグラフ探索、出力パスのプログラミング、
//! DMAストリームのソフトウェアリングバッファ管理を提供する。
//! ホストカーネルは [`KernelServices`] を実装してこのクレートへ
//! PCI/メモリ/割り込み/遅延の各プリミティブを供給する。

extern crate alloc;

mod codec;
mod controller;
mod error;
mod format;
mod kernel_api;
mod path;
mod program;
mod regs;
mod stream;
mod sync;
mod widget;

pub use codec::{Codec, VerbTransport};
pub use controller::Controller;
pub use error::{HdaError, HdaResult};
pub use format::PcmFormat;
pub use kernel_api::{IrqHandlerFn, KernelServices, PciAccessSize};
pub use path::{paths_usable_simultaneously, Path};
pub use program::{path_setup, path_shutdown, set_mute, set_volume};
pub use regs::matches_pci;
pub use stream::Direction;
pub use widget::{AmpCaps, DefaultDevice, Output, OutputGroup, Widget, WidgetType};
