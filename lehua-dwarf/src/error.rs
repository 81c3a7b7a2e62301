//! エラー型
//!
//! DWARF解析の失敗を種別付きで表現します。`NotFound`・`Stop`・
//! `OutOfMemory`は値を持たない番兵で、呼び出し側は種別の照合だけで
//! 判定できます。

use thiserror::Error;

/// DWARF解析のエラー
#[derive(Debug, Error)]
pub enum Error {
    /// 不正または未対応のデバッグ情報。メッセージに問題の属性名や
    /// タグ名を含める
    #[error("{0}")]
    Other(String),

    /// シンボルのアドレスまたは値が見つからない
    #[error("{0}")]
    Lookup(String),

    /// 型解決の再帰が深すぎる
    #[error("maximum DWARF type parsing depth exceeded")]
    Recursion,

    /// 数値が表現範囲を超えた
    #[error("{0}")]
    Overflow(&'static str),

    /// 呼び出し側の契約違反
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// 名前に対応する候補がない。呼び出し側が他のプロバイダを
    /// 試せるように区別して返す
    #[error("not found")]
    NotFound,

    /// 探索を打ち切る内部的な番兵。公開APIのエラーとしては返らない
    #[error("stop")]
    Stop,

    /// インターンマップの領域を確保できなかった
    #[error("out of memory")]
    OutOfMemory,

    /// DWARFバイト列のデコード失敗
    #[error("DWARF decode error: {0}")]
    Dwarf(#[from] gimli::Error),
}

impl Error {
    /// 属性のフォーム不一致
    pub(crate) fn invalid_attr(tag_name: &str, attr: gimli::DwAt) -> Error {
        Error::Other(format!("{} has invalid {}", tag_name, attr))
    }
}
