//! DWARF属性の読み取り
//!
//! DW_AT_*属性をフォームを意識して型付きで読み取ります。属性の検索は
//! DW_AT_specification / DW_AT_abstract_origin の間接参照を透過的に
//! 辿ります。フォーム不一致は属性名入りのエラーになります。

use gimli::Reader;

use crate::cache::TypeCache;
use crate::error::Error;
use crate::types::{ByteOrder, DieRef};
use crate::Result;

/// 間接参照を辿る深さの上限
const MAX_SPECIFICATION_DEPTH: usize = 16;

impl<'d, R: Reader<Offset = usize>> TypeCache<'d, R> {
    /// DIEを開いてクロージャに渡す
    pub(crate) fn with_entry<T>(
        &self,
        die: DieRef,
        f: impl FnOnce(&gimli::Unit<R>, &gimli::DebuggingInformationEntry<'_, '_, R>) -> Result<T>,
    ) -> Result<T> {
        let unit = self.unit(die.unit);
        let mut entries = unit.entries_at_offset(die.offset)?;
        match entries.next_dfs()? {
            Some((_, entry)) => f(unit, entry),
            None => Err(Error::Other("DIE offset is out of range".to_string())),
        }
    }

    /// 属性を検索する。DIE自身に無ければ間接参照先を辿る
    pub(crate) fn attr_integrate(
        &self,
        die: DieRef,
        name: gimli::DwAt,
    ) -> Result<Option<gimli::Attribute<R>>> {
        let mut current = die;
        for _ in 0..MAX_SPECIFICATION_DEPTH {
            let (attr, origin) = self.with_entry(current, |_, entry| {
                if let Some(attr) = entry.attr(name)? {
                    return Ok((Some(attr), None));
                }
                let origin = entry
                    .attr_value(gimli::DW_AT_abstract_origin)?
                    .or(entry.attr_value(gimli::DW_AT_specification)?);
                Ok((None, origin))
            })?;
            if let Some(attr) = attr {
                return Ok(Some(attr));
            }
            match origin.and_then(|value| self.die_ref_from_value(current.unit, value)) {
                Some(target) => current = target,
                None => return Ok(None),
            }
        }
        Ok(None)
    }

    /// DIE参照の属性値をDieRefに変換する
    pub(crate) fn die_ref_from_value(
        &self,
        unit: usize,
        value: gimli::AttributeValue<R>,
    ) -> Option<DieRef> {
        match value {
            gimli::AttributeValue::UnitRef(offset) => Some(DieRef::new(unit, offset)),
            gimli::AttributeValue::DebugInfoRef(offset) => {
                self.die_ref_from_debug_info_offset(offset)
            }
            _ => None,
        }
    }

    /// セクション内オフセットを含むユニットを探してDieRefに変換する
    fn die_ref_from_debug_info_offset(
        &self,
        offset: gimli::DebugInfoOffset<usize>,
    ) -> Option<DieRef> {
        for index in 0..self.unit_count() {
            let header = &self.unit(index).header;
            let start = match header.offset() {
                gimli::UnitSectionOffset::DebugInfoOffset(start) => start.0,
                _ => continue,
            };
            let end = start + header.length_including_self();
            if offset.0 >= start && offset.0 < end {
                return Some(DieRef::new(index, gimli::UnitOffset(offset.0 - start)));
            }
        }
        None
    }

    /// 符号なし整数属性
    pub(crate) fn attr_udata(
        &self,
        die: DieRef,
        tag_name: &str,
        name: gimli::DwAt,
    ) -> Result<Option<u64>> {
        match self.attr_integrate(die, name)? {
            Some(attr) => match attr.udata_value() {
                Some(value) => Ok(Some(value)),
                None => Err(Error::invalid_attr(tag_name, name)),
            },
            None => Ok(None),
        }
    }

    /// フラグ属性。属性が無ければfalse
    pub(crate) fn attr_flag(
        &self,
        die: DieRef,
        tag_name: &str,
        name: gimli::DwAt,
    ) -> Result<bool> {
        match self.attr_integrate(die, name)? {
            Some(attr) => match attr.value() {
                gimli::AttributeValue::Flag(value) => Ok(value),
                _ => Err(Error::invalid_attr(tag_name, name)),
            },
            None => Ok(false),
        }
    }

    /// 文字列属性
    pub(crate) fn attr_string(
        &self,
        die: DieRef,
        tag_name: &str,
        name: gimli::DwAt,
    ) -> Result<Option<String>> {
        match self.attr_integrate(die, name)? {
            Some(attr) => {
                let unit = self.unit(die.unit);
                match self.dwarf.attr_string(unit, attr.value()) {
                    Ok(s) => Ok(Some(s.to_string_lossy()?.into_owned())),
                    Err(_) => Err(Error::invalid_attr(tag_name, name)),
                }
            }
            None => Ok(None),
        }
    }

    /// DW_AT_typeが参照するDIE
    pub(crate) fn attr_type_die(&self, die: DieRef, tag_name: &str) -> Result<Option<DieRef>> {
        match self.attr_integrate(die, gimli::DW_AT_type)? {
            Some(attr) => match self.die_ref_from_value(die.unit, attr.value()) {
                Some(target) => Ok(Some(target)),
                None => Err(Error::Other(format!(
                    "{} has invalid DW_AT_type",
                    tag_name
                ))),
            },
            None => Ok(None),
        }
    }

    /// DW_AT_encodingの値
    pub(crate) fn attr_encoding(&self, die: DieRef) -> Result<Option<gimli::DwAte>> {
        match self.attr_integrate(die, gimli::DW_AT_encoding)? {
            Some(attr) => match attr.value() {
                gimli::AttributeValue::Encoding(value) => Ok(Some(value)),
                _ => Err(Error::Other(
                    "DW_TAG_base_type has missing or invalid DW_AT_encoding".to_string(),
                )),
            },
            None => Ok(None),
        }
    }

    /// DW_AT_low_pcのアドレス
    pub(crate) fn attr_low_pc(&self, die: DieRef) -> Result<Option<u64>> {
        match self.attr_integrate(die, gimli::DW_AT_low_pc)? {
            Some(attr) => match attr.value() {
                gimli::AttributeValue::Addr(address) => Ok(Some(address)),
                _ => Ok(None),
            },
            None => Ok(None),
        }
    }

    /// DW_AT_locationが単一のDW_OP_addrであればそのアドレス
    ///
    /// 属性が無ければNone。それ以外のロケーション式は未対応として
    /// エラーになります。
    pub(crate) fn attr_location_address(&self, die: DieRef) -> Result<Option<u64>> {
        let attr = match self.attr_integrate(die, gimli::DW_AT_location)? {
            Some(attr) => attr,
            None => return Ok(None),
        };
        let expr = match attr.value() {
            gimli::AttributeValue::Exprloc(expr) => expr,
            _ => {
                return Err(Error::Other(
                    "DW_AT_location has unimplemented operation".to_string(),
                ))
            }
        };
        let address_size = self.unit(die.unit).encoding().address_size;
        let mut data = expr.0;
        let opcode = data.read_u8()?;
        if opcode != gimli::DW_OP_addr.0 {
            return Err(Error::Other(
                "DW_AT_location has unimplemented operation".to_string(),
            ));
        }
        let address = data.read_address(address_size)?;
        if !data.is_empty() {
            return Err(Error::Other(
                "DW_AT_location has unimplemented operation".to_string(),
            ));
        }
        Ok(Some(address))
    }

    /// DIEがリトルエンディアンかどうかを判定する
    ///
    /// `check_attr`がtrueならDW_AT_endianityを参照し、DW_END_defaultと
    /// 属性の欠落はELFのデータエンコーディングに従います。falseのときは
    /// 属性を見ないため失敗しません。
    pub(crate) fn die_is_little_endian(&self, die: DieRef, check_attr: bool) -> Result<bool> {
        let endianity = if check_attr {
            match self.attr_integrate(die, gimli::DW_AT_endianity)? {
                Some(attr) => match attr.value() {
                    gimli::AttributeValue::Endianity(value) => value,
                    _ => return Err(Error::Other("invalid DW_AT_endianity".to_string())),
                },
                None => gimli::DW_END_default,
            }
        } else {
            gimli::DW_END_default
        };
        match endianity {
            gimli::DW_END_default => Ok(self.program().byte_order == ByteOrder::Little),
            gimli::DW_END_little => Ok(true),
            gimli::DW_END_big => Ok(false),
            _ => Err(Error::Other("unknown DW_AT_endianity".to_string())),
        }
    }

    /// die_is_little_endianのByteOrder版
    pub(crate) fn die_byte_order(&self, die: DieRef, check_attr: bool) -> Result<ByteOrder> {
        self.die_is_little_endian(die, check_attr).map(|little| {
            if little {
                ByteOrder::Little
            } else {
                ByteOrder::Big
            }
        })
    }

    /// DIEの直下の子を(タグ, DieRef)で列挙する
    pub(crate) fn die_children(&self, die: DieRef) -> Result<Vec<(gimli::DwTag, DieRef)>> {
        let unit = self.unit(die.unit);
        let mut children = Vec::new();
        let mut tree = unit.entries_tree(Some(die.offset))?;
        let root = tree.root()?;
        let mut iter = root.children();
        while let Some(child) = iter.next()? {
            let entry = child.entry();
            children.push((entry.tag(), DieRef::new(die.unit, entry.offset())));
        }
        Ok(children)
    }
}
