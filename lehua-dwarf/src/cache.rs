//! 型キャッシュとDIE解決のディスパッチ
//!
//! DIEアドレスをキーに構築済みの型をインターンし、タグごとのビルダへ
//! ディスパッチします。同じDIEに対する解決は常に同じ型ノードを返し、
//! 再帰の深さは上限で打ち切られます。
//!
//! インターンマップは2つあります。主マップに不完全配列として登録された
//! DIEを、不完全配列を許さない文脈から解決すると、長さ0の配列として
//! 再解釈した型が副マップに登録されます。

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use gimli::Reader;
use tracing::debug;

use crate::error::Error;
use crate::index::DieIndex;
use crate::loader::ProgramInfo;
use crate::types::{
    CompoundKind, DieRef, Language, QualifiedType, Qualifiers, Type, TypeKind,
};
use crate::Result;

/// DIE解決の再帰の上限
const MAX_RESOLUTION_DEPTH: usize = 1000;

/// コンパイルユニットごとの文脈
pub(crate) struct UnitData<R: Reader<Offset = usize>> {
    pub(crate) unit: gimli::Unit<R>,
    /// ユニットのソース言語。DW_AT_languageが未知ならプログラム既定値
    pub(crate) language: Language,
    /// ユニットのソースファイルパス
    pub(crate) file_name: Option<String>,
}

/// インターン済みの型
struct InternedType {
    ty: Rc<Type>,
    qualifiers: Qualifiers,
    /// 不完全配列(またはその別名)としてエンコードされていたか
    is_incomplete_array: bool,
}

/// 名前検索の対象となる型種別
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindKind {
    Int,
    Bool,
    Float,
    Struct,
    Union,
    Class,
    Enum,
    Typedef,
}

/// DWARF型キャッシュ
///
/// プログラム1つ分の型グラフとデバッグ情報索引を所有します。公開APIは
/// `&self`を取り、内部状態の更新は内部可変性で行います。単一スレッドの
/// 協調動作を前提としており、`Send`/`Sync`にはなりません。
pub struct TypeCache<'d, R: Reader<Offset = usize>> {
    pub(crate) dwarf: &'d gimli::Dwarf<R>,
    units: Vec<UnitData<R>>,
    index: DieIndex,
    program: ProgramInfo,
    /// 主インターンマップ
    map: RefCell<HashMap<DieRef, InternedType>>,
    /// 不完全配列を許さない解釈のための副マップ
    cant_be_incomplete_array_map: RefCell<HashMap<DieRef, InternedType>>,
    /// 進行中のDIE解決の深さ
    depth: Cell<usize>,
    /// 言語ごとのvoid型
    void_types: RefCell<HashMap<Language, Rc<Type>>>,
}

impl<'d, R: Reader<Offset = usize>> TypeCache<'d, R> {
    /// 型キャッシュを構築する
    ///
    /// # Arguments
    /// * `dwarf` - 読み取り済みのDWARFコンテキスト
    /// * `program` - ワードサイズ・バイトオーダーなどのプログラム情報
    /// * `bias` - ロードバイアス(実行時アドレス − リンク時アドレス)
    pub fn new(dwarf: &'d gimli::Dwarf<R>, program: ProgramInfo, bias: u64) -> Result<Self> {
        let mut units = Vec::new();
        let mut iter = dwarf.units();
        while let Some(header) = iter.next()? {
            let unit = dwarf.unit(header)?;
            let (language, file_name) = unit_context(dwarf, &unit, &program)?;
            units.push(UnitData {
                unit,
                language,
                file_name,
            });
        }
        let index = DieIndex::build(dwarf, &units, bias)?;
        debug!("built type cache over {} units", units.len());

        Ok(Self {
            dwarf,
            units,
            index,
            program,
            map: RefCell::new(HashMap::new()),
            cant_be_incomplete_array_map: RefCell::new(HashMap::new()),
            depth: Cell::new(0),
            void_types: RefCell::new(HashMap::new()),
        })
    }

    /// デバッグ情報索引への参照
    pub fn index(&self) -> &DieIndex {
        &self.index
    }

    /// プログラムの基本情報
    pub fn program(&self) -> &ProgramInfo {
        &self.program
    }

    pub(crate) fn unit(&self, index: usize) -> &gimli::Unit<R> {
        &self.units[index].unit
    }

    pub(crate) fn unit_count(&self) -> usize {
        self.units.len()
    }

    /// DIEの属するユニットのソース言語
    pub(crate) fn language_of_die(&self, die: DieRef) -> Language {
        self.units[die.unit].language
    }

    /// DIEの属するユニットのファイルパスがフィルタに一致するか
    ///
    /// フィルタが空ならすべてに一致します。
    pub(crate) fn die_matches_filename(&self, die: DieRef, filename: Option<&str>) -> bool {
        let filter = match filename {
            None | Some("") => return true,
            Some(filter) => filter,
        };
        match &self.units[die.unit].file_name {
            Some(path) => path_ends_with(path, filter),
            None => false,
        }
    }

    /// DIEから型を構築する
    ///
    /// 同じDIEに対しては常に同じ型ノードを返します。
    pub fn type_from_die(&self, die: DieRef) -> Result<QualifiedType> {
        self.resolve_internal(die, true)
            .map(|(qualified, _)| qualified)
    }

    /// DIEから型を構築する(内部エントリポイント)
    ///
    /// 戻り値の2つ目は、型が不完全配列型または不完全配列のtypedefとして
    /// エンコードされていたかどうかです(長さ0への置換とは無関係)。
    pub(crate) fn resolve_internal(
        &self,
        die: DieRef,
        can_be_incomplete_array: bool,
    ) -> Result<(QualifiedType, bool)> {
        if self.depth.get() >= MAX_RESOLUTION_DEPTH {
            return Err(Error::Recursion);
        }

        if let Some(found) = self.lookup_interned(die, can_be_incomplete_array) {
            return Ok(found);
        }

        let language = self.language_of_die(die);
        let tag = self.with_entry(die, |_, entry| Ok(entry.tag()))?;

        self.depth.set(self.depth.get() + 1);
        let built = self.build_type(die, tag, language, can_be_incomplete_array);
        self.depth.set(self.depth.get() - 1);
        let (qualified, is_incomplete_array) = built?;

        let map = if !can_be_incomplete_array && is_incomplete_array {
            &self.cant_be_incomplete_array_map
        } else {
            &self.map
        };
        let mut map = map.borrow_mut();
        map.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
        map.insert(
            die,
            InternedType {
                ty: Rc::clone(&qualified.ty),
                qualifiers: qualified.qualifiers,
                is_incomplete_array,
            },
        );
        Ok((qualified, is_incomplete_array))
    }

    fn lookup_interned(
        &self,
        die: DieRef,
        can_be_incomplete_array: bool,
    ) -> Option<(QualifiedType, bool)> {
        let map = self.map.borrow();
        let entry = map.get(&die)?;
        if !can_be_incomplete_array && entry.is_incomplete_array {
            // 長さ0として再解釈した型は副マップにある。なければ構築する
            let cant_map = self.cant_be_incomplete_array_map.borrow();
            let entry = cant_map.get(&die)?;
            return Some((
                QualifiedType {
                    ty: Rc::clone(&entry.ty),
                    qualifiers: entry.qualifiers,
                },
                entry.is_incomplete_array,
            ));
        }
        Some((
            QualifiedType {
                ty: Rc::clone(&entry.ty),
                qualifiers: entry.qualifiers,
            },
            entry.is_incomplete_array,
        ))
    }

    fn build_type(
        &self,
        die: DieRef,
        tag: gimli::DwTag,
        language: Language,
        can_be_incomplete_array: bool,
    ) -> Result<(QualifiedType, bool)> {
        match tag {
            gimli::DW_TAG_const_type => {
                self.qualified_child(die, "DW_TAG_const_type", language, Qualifiers::CONST)
            }
            gimli::DW_TAG_volatile_type => {
                self.qualified_child(die, "DW_TAG_volatile_type", language, Qualifiers::VOLATILE)
            }
            gimli::DW_TAG_restrict_type => {
                self.qualified_child(die, "DW_TAG_restrict_type", language, Qualifiers::RESTRICT)
            }
            gimli::DW_TAG_atomic_type => {
                self.qualified_child(die, "DW_TAG_atomic_type", language, Qualifiers::ATOMIC)
            }
            gimli::DW_TAG_base_type => self
                .base_type_from_die(die, language)
                .map(|ty| (QualifiedType::unqualified(ty), false)),
            gimli::DW_TAG_structure_type => self
                .compound_type_from_die(die, language, CompoundKind::Struct)
                .map(|ty| (QualifiedType::unqualified(ty), false)),
            gimli::DW_TAG_union_type => self
                .compound_type_from_die(die, language, CompoundKind::Union)
                .map(|ty| (QualifiedType::unqualified(ty), false)),
            gimli::DW_TAG_class_type => self
                .compound_type_from_die(die, language, CompoundKind::Class)
                .map(|ty| (QualifiedType::unqualified(ty), false)),
            gimli::DW_TAG_enumeration_type => self
                .enum_type_from_die(die, language)
                .map(|ty| (QualifiedType::unqualified(ty), false)),
            gimli::DW_TAG_typedef => self
                .typedef_type_from_die(die, language, can_be_incomplete_array)
                .map(|(ty, is_incomplete)| (QualifiedType::unqualified(ty), is_incomplete)),
            gimli::DW_TAG_pointer_type => self
                .pointer_type_from_die(die, language)
                .map(|ty| (QualifiedType::unqualified(ty), false)),
            gimli::DW_TAG_array_type => self
                .array_type_from_die(die, language, can_be_incomplete_array)
                .map(|(ty, is_incomplete)| (QualifiedType::unqualified(ty), is_incomplete)),
            gimli::DW_TAG_subroutine_type => self
                .function_type_from_die(die, language, "DW_TAG_subroutine_type")
                .map(|ty| (QualifiedType::unqualified(ty), false)),
            gimli::DW_TAG_subprogram => self
                .function_type_from_die(die, language, "DW_TAG_subprogram")
                .map(|ty| (QualifiedType::unqualified(ty), false)),
            _ => Err(Error::Other(format!(
                "unknown DWARF type tag {:#x}",
                tag.0
            ))),
        }
    }

    /// 修飾子タグの子を解決して修飾子ビットを重ねる
    fn qualified_child(
        &self,
        die: DieRef,
        tag_name: &str,
        language: Language,
        qualifier: Qualifiers,
    ) -> Result<(QualifiedType, bool)> {
        let (mut qualified, _) = self.type_from_child(die, tag_name, language, true, true)?;
        qualified.qualifiers |= qualifier;
        Ok((qualified, false))
    }

    /// 親DIEのDW_AT_typeから型を解決する
    ///
    /// # Arguments
    /// * `tag_name` - エラーメッセージに使う親DIEのタグ名
    /// * `can_be_void` - 属性の欠落をvoid型として扱うか
    /// * `can_be_incomplete_array` - 不完全配列型を許すか
    pub(crate) fn type_from_child(
        &self,
        parent: DieRef,
        tag_name: &str,
        language: Language,
        can_be_void: bool,
        can_be_incomplete_array: bool,
    ) -> Result<(QualifiedType, bool)> {
        match self.attr_type_die(parent, tag_name)? {
            Some(child) => self.resolve_internal(child, can_be_incomplete_array),
            None => {
                if can_be_void {
                    Ok((
                        QualifiedType::unqualified(self.void_type(language)),
                        false,
                    ))
                } else {
                    Err(Error::Other(format!("{} is missing DW_AT_type", tag_name)))
                }
            }
        }
    }

    /// 子のDW_AT_typeを遅延型として切り出す
    ///
    /// メンバと仮引数ではDW_AT_typeが必須のため、欠落はエラーです。
    pub(crate) fn lazy_type_from_die(
        &self,
        parent: DieRef,
        tag_name: &str,
        can_be_incomplete_array: bool,
    ) -> Result<crate::types::LazyType> {
        match self.attr_type_die(parent, tag_name)? {
            Some(child) => Ok(crate::types::LazyType::new(child, can_be_incomplete_array)),
            None => Err(Error::Other(format!("{} is missing DW_AT_type", tag_name))),
        }
    }

    /// 言語ごとのvoid型
    pub(crate) fn void_type(&self, language: Language) -> Rc<Type> {
        let mut voids = self.void_types.borrow_mut();
        Rc::clone(
            voids
                .entry(language)
                .or_insert_with(|| Type::new(TypeKind::Void, language)),
        )
    }

    /// 名前から型を検索する
    ///
    /// 基底型の種別(Int/Bool/Float)はいずれもDW_TAG_base_typeに対応する
    /// ため、解決後に意味上の種別が一致する最初の候補を返します。
    pub fn find_type(
        &self,
        kind: FindKind,
        name: &str,
        filename: Option<&str>,
    ) -> Result<QualifiedType> {
        let tag = match kind {
            FindKind::Int | FindKind::Bool | FindKind::Float => gimli::DW_TAG_base_type,
            FindKind::Struct => gimli::DW_TAG_structure_type,
            FindKind::Union => gimli::DW_TAG_union_type,
            FindKind::Class => gimli::DW_TAG_class_type,
            FindKind::Enum => gimli::DW_TAG_enumeration_type,
            FindKind::Typedef => gimli::DW_TAG_typedef,
        };
        for entry in self.index.entries(name) {
            if entry.tag != tag || !self.die_matches_filename(entry.die, filename) {
                continue;
            }
            let qualified = self.type_from_die(entry.die)?;
            if kind_matches(&qualified.ty, kind) {
                return Ok(qualified);
            }
        }
        Err(Error::NotFound)
    }
}

/// 解決済みの型が検索種別に一致するか
fn kind_matches(ty: &Type, kind: FindKind) -> bool {
    match (ty.kind(), kind) {
        (TypeKind::Int { .. }, FindKind::Int) => true,
        (TypeKind::Bool { .. }, FindKind::Bool) => true,
        (TypeKind::Float { .. }, FindKind::Float) => true,
        (
            TypeKind::Compound {
                kind: CompoundKind::Struct,
                ..
            },
            FindKind::Struct,
        ) => true,
        (
            TypeKind::Compound {
                kind: CompoundKind::Union,
                ..
            },
            FindKind::Union,
        ) => true,
        (
            TypeKind::Compound {
                kind: CompoundKind::Class,
                ..
            },
            FindKind::Class,
        ) => true,
        (TypeKind::Enum { .. }, FindKind::Enum) => true,
        (TypeKind::Typedef { .. }, FindKind::Typedef) => true,
        _ => false,
    }
}

/// ユニットのルートDIEから言語とファイル名を読み取る
fn unit_context<R: Reader<Offset = usize>>(
    dwarf: &gimli::Dwarf<R>,
    unit: &gimli::Unit<R>,
    program: &ProgramInfo,
) -> Result<(Language, Option<String>)> {
    let mut language = program.default_language;
    let mut file_name = None;

    let mut entries = unit.entries();
    if let Some((_, root)) = entries.next_dfs()? {
        if let Some(gimli::AttributeValue::Language(lang)) =
            root.attr_value(gimli::DW_AT_language)?
        {
            if let Some(mapped) = language_from_dwarf(lang) {
                language = mapped;
            }
        }
        if let Some(value) = root.attr_value(gimli::DW_AT_name)? {
            if let Ok(s) = dwarf.attr_string(unit, value) {
                file_name = Some(s.to_string_lossy()?.into_owned());
            }
        }
    }
    Ok((language, file_name))
}

/// DW_LANG_*をソース言語へ対応付ける
fn language_from_dwarf(lang: gimli::DwLang) -> Option<Language> {
    match lang {
        gimli::DW_LANG_C | gimli::DW_LANG_C89 | gimli::DW_LANG_C99 | gimli::DW_LANG_C11 => {
            Some(Language::C)
        }
        gimli::DW_LANG_C_plus_plus
        | gimli::DW_LANG_C_plus_plus_03
        | gimli::DW_LANG_C_plus_plus_11
        | gimli::DW_LANG_C_plus_plus_14 => Some(Language::Cpp),
        _ => None,
    }
}

/// パスの末尾コンポーネント列がフィルタと一致するか
fn path_ends_with(path: &str, filter: &str) -> bool {
    let mut path_parts = path.rsplit('/').filter(|c| !c.is_empty());
    let mut filter_parts = filter.rsplit('/').filter(|c| !c.is_empty());
    loop {
        match (path_parts.next(), filter_parts.next()) {
            (_, None) => return true,
            (None, Some(_)) => return false,
            (Some(p), Some(f)) => {
                if p != f {
                    return false;
                }
            }
        }
    }
}
