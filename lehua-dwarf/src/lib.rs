//! Lehua DWARF型トランスレータ
//!
//! このクレートは、パース済みのDWARFデバッグ情報から言語非依存の
//! 型グラフをメモリ上に再構築し、変数・関数・列挙定数を型付きの
//! アドレス可能な値として解決します。デバッグ情報インデックスと
//! 上位のプログラム検査APIの間の意味論的な橋渡しを担います。
//!
//! 型はDIE単位でインターンされ、同じDIEの解決は常に同じノードを
//! 返します。メンバや仮引数の型は遅延解決され、自己参照する構造体の
//! ような循環した型グラフも停止保証付きで組み立てられます。

pub mod loader;
pub mod index;
pub mod types;
pub mod cache;
pub mod objects;
pub mod error;

mod attrs;
mod builders;

pub use loader::{DwarfLoader, ProgramInfo};
pub use index::{DieIndex, IndexEntry};
pub use types::{
    ByteOrder, CompoundKind, DieRef, EnumValue, Enumerator, Language, LazyType, Member,
    Parameter, QualifiedType, Qualifiers, Type, TypeKind,
};
pub use cache::{FindKind, TypeCache};
pub use objects::{Object, ObjectFlags, ObjectResolver, ObjectValue};
pub use error::Error;

/// DWARF解析の結果型
pub type Result<T> = std::result::Result<T, Error>;
