//! テスト用のDWARF合成ヘルパ
//!
//! gimliのwrite側で1ユニット分のDWARFをメモリ上に合成し、read側の
//! スライスに変換して型キャッシュへ渡します。

#![allow(dead_code)]

use std::collections::HashMap;

use gimli::write::{self, AttributeValue, EndianVec, Sections};
use gimli::RunTimeEndian;

use lehua_dwarf::{ByteOrder, DieRef, Language, ProgramInfo, TypeCache};

pub type Reader = gimli::EndianSlice<'static, RunTimeEndian>;

/// リトルエンディアンの64bitプログラム
pub fn le_program() -> ProgramInfo {
    ProgramInfo {
        word_size: 8,
        byte_order: ByteOrder::Little,
        default_language: Language::C,
    }
}

/// ビッグエンディアンの64bitプログラム
pub fn be_program() -> ProgramInfo {
    ProgramInfo {
        word_size: 8,
        byte_order: ByteOrder::Big,
        default_language: Language::C,
    }
}

fn runtime_endian(byte_order: ByteOrder) -> RunTimeEndian {
    match byte_order {
        ByteOrder::Little => RunTimeEndian::Little,
        ByteOrder::Big => RunTimeEndian::Big,
    }
}

/// 1ユニットのDWARFを合成して読み取り用に変換する
pub fn build_dwarf(
    program: ProgramInfo,
    populate: impl FnOnce(&mut write::DwarfUnit),
) -> &'static gimli::Dwarf<Reader> {
    let encoding = gimli::Encoding {
        format: gimli::Format::Dwarf32,
        version: 4,
        address_size: program.word_size,
    };
    let mut dwarf = write::DwarfUnit::new(encoding);
    populate(&mut dwarf);

    let endian = runtime_endian(program.byte_order);
    let mut sections = Sections::new(EndianVec::new(endian));
    dwarf
        .write(&mut sections)
        .expect("failed to write DWARF sections");

    let mut data: HashMap<&'static str, &'static [u8]> = HashMap::new();
    sections
        .for_each(|id, section| {
            let bytes: &'static [u8] = Box::leak(section.slice().to_vec().into_boxed_slice());
            data.insert(id.name(), bytes);
            Ok::<(), gimli::Error>(())
        })
        .expect("failed to collect DWARF sections");

    let dwarf = gimli::Dwarf::load(|id| {
        Ok::<_, gimli::Error>(gimli::EndianSlice::new(
            data.get(id.name()).copied().unwrap_or(&[]),
            endian,
        ))
    })
    .expect("failed to load DWARF sections");
    Box::leak(Box::new(dwarf))
}

pub fn make_cache(
    dwarf: &'static gimli::Dwarf<Reader>,
    program: ProgramInfo,
) -> TypeCache<'static, Reader> {
    TypeCache::new(dwarf, program, 0).expect("failed to build type cache")
}

pub fn make_cache_with_bias(
    dwarf: &'static gimli::Dwarf<Reader>,
    program: ProgramInfo,
    bias: u64,
) -> TypeCache<'static, Reader> {
    TypeCache::new(dwarf, program, bias).expect("failed to build type cache")
}

/// ルートDIEに言語とファイル名を設定する
pub fn set_unit_root(dwarf: &mut write::DwarfUnit, language: gimli::DwLang, file_name: &str) {
    let root = dwarf.unit.root();
    let entry = dwarf.unit.get_mut(root);
    entry.set(
        gimli::DW_AT_language,
        AttributeValue::Udata(u64::from(language.0)),
    );
    entry.set(
        gimli::DW_AT_name,
        AttributeValue::String(file_name.as_bytes().to_vec()),
    );
}

pub fn add_die(
    dwarf: &mut write::DwarfUnit,
    parent: write::UnitEntryId,
    tag: gimli::DwTag,
) -> write::UnitEntryId {
    dwarf.unit.add(parent, tag)
}

pub fn root_die(dwarf: &mut write::DwarfUnit) -> write::UnitEntryId {
    dwarf.unit.root()
}

pub fn set_attr(
    dwarf: &mut write::DwarfUnit,
    id: write::UnitEntryId,
    name: gimli::DwAt,
    value: AttributeValue,
) {
    dwarf.unit.get_mut(id).set(name, value);
}

pub fn set_name(dwarf: &mut write::DwarfUnit, id: write::UnitEntryId, name: &str) {
    set_attr(
        dwarf,
        id,
        gimli::DW_AT_name,
        AttributeValue::String(name.as_bytes().to_vec()),
    );
}

pub fn set_type_ref(
    dwarf: &mut write::DwarfUnit,
    id: write::UnitEntryId,
    target: write::UnitEntryId,
) {
    set_attr(dwarf, id, gimli::DW_AT_type, AttributeValue::UnitRef(target));
}

/// 基底型DIEを追加する
pub fn add_base_type(
    dwarf: &mut write::DwarfUnit,
    name: &str,
    encoding: gimli::DwAte,
    size: u64,
) -> write::UnitEntryId {
    let root = dwarf.unit.root();
    let id = dwarf.unit.add(root, gimli::DW_TAG_base_type);
    set_name(dwarf, id, name);
    set_attr(
        dwarf,
        id,
        gimli::DW_AT_encoding,
        AttributeValue::Udata(u64::from(encoding.0)),
    );
    set_attr(dwarf, id, gimli::DW_AT_byte_size, AttributeValue::Udata(size));
    id
}

/// 構造体DIEを追加する
pub fn add_struct(
    dwarf: &mut write::DwarfUnit,
    name: Option<&str>,
    size: u64,
) -> write::UnitEntryId {
    let root = dwarf.unit.root();
    let id = dwarf.unit.add(root, gimli::DW_TAG_structure_type);
    if let Some(name) = name {
        set_name(dwarf, id, name);
    }
    set_attr(dwarf, id, gimli::DW_AT_byte_size, AttributeValue::Udata(size));
    id
}

/// メンバDIEを追加する
pub fn add_member(
    dwarf: &mut write::DwarfUnit,
    parent: write::UnitEntryId,
    name: &str,
    ty: write::UnitEntryId,
    byte_offset: u64,
) -> write::UnitEntryId {
    let id = dwarf.unit.add(parent, gimli::DW_TAG_member);
    set_name(dwarf, id, name);
    set_type_ref(dwarf, id, ty);
    set_attr(
        dwarf,
        id,
        gimli::DW_AT_data_member_location,
        AttributeValue::Udata(byte_offset),
    );
    id
}

/// 長さの無いsubrangeを1つ持つ配列DIEを追加する
pub fn add_incomplete_array(
    dwarf: &mut write::DwarfUnit,
    element: write::UnitEntryId,
) -> write::UnitEntryId {
    let root = dwarf.unit.root();
    let id = dwarf.unit.add(root, gimli::DW_TAG_array_type);
    set_type_ref(dwarf, id, element);
    dwarf.unit.add(id, gimli::DW_TAG_subrange_type);
    id
}

/// 変数DIEを追加する
pub fn add_variable(
    dwarf: &mut write::DwarfUnit,
    name: &str,
    ty: write::UnitEntryId,
) -> write::UnitEntryId {
    let root = dwarf.unit.root();
    let id = dwarf.unit.add(root, gimli::DW_TAG_variable);
    set_name(dwarf, id, name);
    set_type_ref(dwarf, id, ty);
    id
}

/// DW_OP_addr 1個だけのロケーション式のバイト列
pub fn op_addr(address: u64, byte_order: ByteOrder) -> Vec<u8> {
    let mut bytes = vec![gimli::DW_OP_addr.0];
    match byte_order {
        ByteOrder::Little => bytes.extend_from_slice(&address.to_le_bytes()),
        ByteOrder::Big => bytes.extend_from_slice(&address.to_be_bytes()),
    }
    bytes
}

/// 条件に一致する最初のDIEを探す
pub fn find_die(
    dwarf: &gimli::Dwarf<Reader>,
    mut predicate: impl FnMut(
        &gimli::Unit<Reader>,
        &gimli::DebuggingInformationEntry<'_, '_, Reader>,
    ) -> bool,
) -> DieRef {
    let mut result = None;
    let mut unit_index = 0;
    let mut units = dwarf.units();
    while let Some(header) = units.next().expect("failed to read unit header") {
        let unit = dwarf.unit(header).expect("failed to parse unit");
        let mut entries = unit.entries();
        while let Some((_, entry)) = entries.next_dfs().expect("failed to walk DIEs") {
            if predicate(&unit, entry) {
                result = Some(DieRef::new(unit_index, entry.offset()));
                break;
            }
        }
        if result.is_some() {
            break;
        }
        unit_index += 1;
    }
    result.expect("no matching DIE")
}

/// タグが一致する最初のDIEを探す
pub fn find_die_by_tag(dwarf: &gimli::Dwarf<Reader>, tag: gimli::DwTag) -> DieRef {
    find_die(dwarf, |_, entry| entry.tag() == tag)
}

/// タグが一致する最後のDIEを探す
pub fn find_last_die_by_tag(dwarf: &gimli::Dwarf<Reader>, tag: gimli::DwTag) -> DieRef {
    let mut result = None;
    let mut unit_index = 0;
    let mut units = dwarf.units();
    while let Some(header) = units.next().expect("failed to read unit header") {
        let unit = dwarf.unit(header).expect("failed to parse unit");
        let mut entries = unit.entries();
        while let Some((_, entry)) = entries.next_dfs().expect("failed to walk DIEs") {
            if entry.tag() == tag {
                result = Some(DieRef::new(unit_index, entry.offset()));
            }
        }
        unit_index += 1;
    }
    result.expect("no matching DIE")
}
