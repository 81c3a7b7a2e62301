//! デバッグ情報の名前索引
//!
//! 各コンパイルユニットのルート直下のDIEを名前で引けるようにします。
//! DW_AT_declarationの付いたDIEは索引に入らないため、検索結果は
//! 常に定義を指します。

use std::collections::HashMap;

use gimli::Reader;
use tracing::debug;

use crate::cache::UnitData;
use crate::types::DieRef;
use crate::Result;

/// 索引対象のタグ
const INDEXED_TAGS: &[gimli::DwTag] = &[
    gimli::DW_TAG_base_type,
    gimli::DW_TAG_structure_type,
    gimli::DW_TAG_union_type,
    gimli::DW_TAG_class_type,
    gimli::DW_TAG_typedef,
    gimli::DW_TAG_subprogram,
    gimli::DW_TAG_variable,
];

/// 索引のエントリ
#[derive(Debug, Clone, Copy)]
pub struct IndexEntry {
    /// 索引上のタグ。列挙子はDW_TAG_enumeratorで引ける
    pub tag: gimli::DwTag,
    /// 対応するDIE。列挙子では親の列挙型DIEを指す
    pub die: DieRef,
    /// ロードバイアス
    pub bias: u64,
}

/// 名前からDIEへの索引
#[derive(Debug, Default)]
pub struct DieIndex {
    entries: HashMap<String, Vec<IndexEntry>>,
}

impl DieIndex {
    /// 全ユニットを走査して索引を構築する
    pub(crate) fn build<R: Reader<Offset = usize>>(
        dwarf: &gimli::Dwarf<R>,
        units: &[UnitData<R>],
        bias: u64,
    ) -> Result<Self> {
        let mut index = DieIndex::default();
        for (unit_index, data) in units.iter().enumerate() {
            index.index_unit(dwarf, data, unit_index, bias)?;
        }
        debug!("indexed {} names", index.entries.len());
        Ok(index)
    }

    /// 名前に対応するエントリ列。出現順は決定的なユニット走査順
    pub fn entries(&self, name: &str) -> &[IndexEntry] {
        self.entries.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    fn insert(&mut self, name: String, entry: IndexEntry) {
        self.entries.entry(name).or_default().push(entry);
    }

    fn index_unit<R: Reader<Offset = usize>>(
        &mut self,
        dwarf: &gimli::Dwarf<R>,
        data: &UnitData<R>,
        unit_index: usize,
        bias: u64,
    ) -> Result<()> {
        let unit = &data.unit;
        let mut tree = unit.entries_tree(None)?;
        let root = tree.root()?;
        let mut children = root.children();
        while let Some(child) = children.next()? {
            let (tag, offset, declaration, name) = {
                let entry = child.entry();
                (
                    entry.tag(),
                    entry.offset(),
                    die_flag(entry, gimli::DW_AT_declaration)?,
                    die_name(dwarf, unit, entry)?,
                )
            };
            if declaration {
                continue;
            }

            if tag == gimli::DW_TAG_enumeration_type {
                let enum_ref = DieRef::new(unit_index, offset);
                if let Some(name) = name {
                    self.insert(
                        name,
                        IndexEntry {
                            tag,
                            die: enum_ref,
                            bias,
                        },
                    );
                }
                // 列挙子は自身の名前で親の列挙型DIEを引けるようにする
                let mut enum_children = child.children();
                while let Some(enum_child) = enum_children.next()? {
                    let enumerator = enum_child.entry();
                    if enumerator.tag() != gimli::DW_TAG_enumerator {
                        continue;
                    }
                    if let Some(name) = die_name(dwarf, unit, enumerator)? {
                        self.insert(
                            name,
                            IndexEntry {
                                tag: gimli::DW_TAG_enumerator,
                                die: enum_ref,
                                bias,
                            },
                        );
                    }
                }
                continue;
            }

            if !INDEXED_TAGS.contains(&tag) {
                continue;
            }
            if let Some(name) = name {
                self.insert(
                    name,
                    IndexEntry {
                        tag,
                        die: DieRef::new(unit_index, offset),
                        bias,
                    },
                );
            }
        }
        Ok(())
    }
}

fn die_name<R: Reader<Offset = usize>>(
    dwarf: &gimli::Dwarf<R>,
    unit: &gimli::Unit<R>,
    entry: &gimli::DebuggingInformationEntry<'_, '_, R>,
) -> Result<Option<String>> {
    match entry.attr_value(gimli::DW_AT_name)? {
        Some(value) => match dwarf.attr_string(unit, value) {
            Ok(s) => Ok(Some(s.to_string_lossy()?.into_owned())),
            Err(_) => Ok(None),
        },
        None => Ok(None),
    }
}

fn die_flag<R: Reader<Offset = usize>>(
    entry: &gimli::DebuggingInformationEntry<'_, '_, R>,
    name: gimli::DwAt,
) -> Result<bool> {
    match entry.attr_value(name)? {
        Some(gimli::AttributeValue::Flag(value)) => Ok(value),
        _ => Ok(false),
    }
}
