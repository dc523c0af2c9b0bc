//! エラーハンドリングモジュール
//!
//! ドライバ全体で使用される統一エラー型を定義します。
//! "Success" に対応するバリアントは存在せず、`Result::Ok` がその役割を担います。

use core::fmt;

/// HDA ドライバの統一エラー型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HdaError {
    /// ハードウェア/コーデックが要求された機能を備えていない、
    /// またはどの対応構成でも満たせないパラメータが渡された
    Unsupported,
    /// 物理/仮想/ヒープ割り当てが失敗した
    NoMemory,
    /// ポーリングが期待するハードウェア状態を観測せずに
    /// 固定デッドラインを超過した
    Timeout,
}

impl fmt::Display for HdaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HdaError::Unsupported => write!(f, "unsupported"),
            HdaError::NoMemory => write!(f, "out of memory"),
            HdaError::Timeout => write!(f, "timeout"),
        }
    }
}

/// ドライバの結果型エイリアス
pub type HdaResult<T> = Result<T, HdaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", HdaError::Timeout), "timeout");
        assert_eq!(format!("{}", HdaError::NoMemory), "out of memory");
        assert_eq!(format!("{}", HdaError::Unsupported), "unsupported");
    }
}
