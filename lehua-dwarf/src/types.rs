//! 型グラフのデータモデル
//!
//! DWARFから再構築した言語非依存の型グラフを表現します。ノードは
//! 一度公開されたら不変で、DIE単位でインターンされます。キャッシュが
//! `Rc`の強参照を保持し、利用側は複製した`Rc`を通じて参照します。

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use gimli::Reader;

use crate::cache::TypeCache;
use crate::Result;

/// DIEの識別子
///
/// コンパイルユニットのインデックスとユニット内オフセットの組で、
/// キャッシュ全体で一意にDIEを指します。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DieRef {
    /// ユニットのインデックス
    pub unit: usize,
    /// ユニット内のDIEオフセット
    pub offset: gimli::UnitOffset<usize>,
}

impl DieRef {
    pub fn new(unit: usize, offset: gimli::UnitOffset<usize>) -> Self {
        Self { unit, offset }
    }
}

/// ソース言語
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    C,
    Cpp,
}

/// バイトオーダー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

/// 型修飾子の集合
///
/// const/volatile/restrict/_Atomic を型参照へのオーバーレイとして
/// 表現します。修飾子が独立したノードになることはありません。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Qualifiers(u8);

impl Qualifiers {
    pub const NONE: Qualifiers = Qualifiers(0);
    pub const CONST: Qualifiers = Qualifiers(1 << 0);
    pub const VOLATILE: Qualifiers = Qualifiers(1 << 1);
    pub const RESTRICT: Qualifiers = Qualifiers(1 << 2);
    pub const ATOMIC: Qualifiers = Qualifiers(1 << 3);

    pub fn contains(self, other: Qualifiers) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Qualifiers {
    type Output = Qualifiers;

    fn bitor(self, rhs: Qualifiers) -> Qualifiers {
        Qualifiers(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Qualifiers {
    fn bitor_assign(&mut self, rhs: Qualifiers) {
        self.0 |= rhs.0;
    }
}

/// 修飾子付きの型参照
#[derive(Debug, Clone)]
pub struct QualifiedType {
    pub ty: Rc<Type>,
    pub qualifiers: Qualifiers,
}

impl QualifiedType {
    /// 修飾子なしの型参照を作る
    pub fn unqualified(ty: Rc<Type>) -> Self {
        Self {
            ty,
            qualifiers: Qualifiers::NONE,
        }
    }
}

/// 構造体・共用体・クラスの区別
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompoundKind {
    Struct,
    Union,
    Class,
}

/// 構造体・共用体・クラスのメンバ
#[derive(Debug)]
pub struct Member {
    /// メンバ名。無名メンバはNone
    pub name: Option<String>,
    /// メンバの型(遅延解決)
    pub ty: LazyType,
    /// 包含オブジェクト先頭からのビットオフセット
    pub bit_offset: u64,
    /// ビットフィールドのビット幅。0なら通常のメンバ
    pub bit_field_size: u64,
}

/// 関数の仮引数
#[derive(Debug)]
pub struct Parameter {
    pub name: Option<String>,
    /// 仮引数の型(遅延解決)
    pub ty: LazyType,
}

/// 列挙子の値
///
/// 符号の解釈は列挙型の互換整数型で判別されます。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumValue {
    Signed(i64),
    Unsigned(u64),
}

/// 列挙子
#[derive(Debug, Clone)]
pub struct Enumerator {
    pub name: String,
    pub value: EnumValue,
}

/// 型ノードの種別と内容
#[derive(Debug)]
pub enum TypeKind {
    /// void型
    Void,
    /// 整数型
    Int {
        name: String,
        size: u64,
        is_signed: bool,
    },
    /// 真偽値型
    Bool { name: String, size: u64 },
    /// 浮動小数点型
    Float { name: String, size: u64 },
    /// 複素数型。realは実部の型
    Complex {
        name: String,
        size: u64,
        real: Rc<Type>,
    },
    /// ポインタ型
    Pointer { referenced: QualifiedType, size: u64 },
    /// 配列型。lengthがNoneなら不完全配列
    Array {
        element: QualifiedType,
        length: Option<u64>,
    },
    /// typedef
    Typedef { name: String, aliased: QualifiedType },
    /// 構造体・共用体・クラス
    Compound {
        kind: CompoundKind,
        /// タグ名。無名ならNone
        tag: Option<String>,
        size: u64,
        /// DIEの出現順を保ったメンバ列
        members: Vec<Member>,
        is_complete: bool,
    },
    /// 列挙型
    Enum {
        tag: Option<String>,
        /// 互換整数型。不完全な列挙型ではNone
        compatible: Option<Rc<Type>>,
        enumerators: Vec<Enumerator>,
        is_complete: bool,
    },
    /// 関数型
    Function {
        return_type: QualifiedType,
        parameters: Vec<Parameter>,
        is_variadic: bool,
    },
}

/// 型ノード
#[derive(Debug)]
pub struct Type {
    kind: TypeKind,
    language: Language,
}

impl Type {
    pub(crate) fn new(kind: TypeKind, language: Language) -> Rc<Type> {
        Rc::new(Type { kind, language })
    }

    pub fn kind(&self) -> &TypeKind {
        &self.kind
    }

    pub fn language(&self) -> Language {
        self.language
    }

    /// 完全な型かどうか
    pub fn is_complete(&self) -> bool {
        match &self.kind {
            TypeKind::Array { length, .. } => length.is_some(),
            TypeKind::Compound { is_complete, .. } => *is_complete,
            TypeKind::Enum { is_complete, .. } => *is_complete,
            _ => true,
        }
    }

    /// 型のバイトサイズ。サイズを持たない型はNone
    pub fn byte_size(&self) -> Option<u64> {
        match &self.kind {
            TypeKind::Int { size, .. }
            | TypeKind::Bool { size, .. }
            | TypeKind::Float { size, .. }
            | TypeKind::Complex { size, .. }
            | TypeKind::Pointer { size, .. } => Some(*size),
            TypeKind::Compound {
                size, is_complete, ..
            } => {
                if *is_complete {
                    Some(*size)
                } else {
                    None
                }
            }
            TypeKind::Enum {
                compatible,
                is_complete,
                ..
            } => {
                if *is_complete {
                    compatible.as_ref()?.byte_size()
                } else {
                    None
                }
            }
            TypeKind::Typedef { aliased, .. } => aliased.ty.byte_size(),
            TypeKind::Array { element, length } => {
                let length = (*length)?;
                length.checked_mul(element.ty.byte_size()?)
            }
            TypeKind::Void | TypeKind::Function { .. } => None,
        }
    }

    /// typedefを剥がした実体の型
    pub fn underlying(self: &Rc<Type>) -> Rc<Type> {
        let mut ty = Rc::clone(self);
        while let TypeKind::Typedef { aliased, .. } = ty.kind() {
            let next = Rc::clone(&aliased.ty);
            ty = next;
        }
        ty
    }
}

/// 遅延型
///
/// メンバや仮引数の型解決を初回参照まで遅らせます。親の複合型や
/// 関数型を子の解決より先にインターンできるため、構造体が自分自身への
/// ポインタを含むような循環がここで断ち切られます。
#[derive(Debug)]
pub struct LazyType {
    die: DieRef,
    can_be_incomplete_array: bool,
    /// 解決結果のメモ。強参照はインターナ側が保持する
    resolved: RefCell<Option<(Weak<Type>, Qualifiers)>>,
}

impl LazyType {
    pub(crate) fn new(die: DieRef, can_be_incomplete_array: bool) -> Self {
        Self {
            die,
            can_be_incomplete_array,
            resolved: RefCell::new(None),
        }
    }

    /// 解決対象のDIE
    pub fn die(&self) -> DieRef {
        self.die
    }

    /// 型を評価する
    ///
    /// 初回の評価で型キャッシュを通して解決し、結果をメモ化します。
    /// 2回目以降は同じ型参照を返します。
    pub fn evaluate<R: Reader<Offset = usize>>(
        &self,
        cache: &TypeCache<'_, R>,
    ) -> Result<QualifiedType> {
        if let Some((ty, qualifiers)) = &*self.resolved.borrow() {
            if let Some(ty) = ty.upgrade() {
                return Ok(QualifiedType {
                    ty,
                    qualifiers: *qualifiers,
                });
            }
        }
        let (qualified, _) = cache.resolve_internal(self.die, self.can_be_incomplete_array)?;
        *self.resolved.borrow_mut() =
            Some((Rc::downgrade(&qualified.ty), qualified.qualifiers));
        Ok(qualified)
    }
}
