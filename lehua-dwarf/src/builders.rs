//! タグ別の型ビルダ
//!
//! 基底型・複合型・列挙型・配列などをDIEから組み立てます。コンパイラの
//! 世代ごとの癖(エンコーディングの欠落や空配列の表現)への対応も
//! ここに集約します。

use std::rc::Rc;

use gimli::Reader;

use crate::cache::TypeCache;
use crate::error::Error;
use crate::types::{
    CompoundKind, DieRef, EnumValue, Enumerator, Language, LazyType, Member, Parameter,
    QualifiedType, Type, TypeKind,
};
use crate::Result;

/// 配列の1次元
struct ArrayDimension {
    length: u64,
    is_complete: bool,
}

impl<'d, R: Reader<Offset = usize>> TypeCache<'d, R> {
    /// DW_TAG_base_type
    pub(crate) fn base_type_from_die(&self, die: DieRef, language: Language) -> Result<Rc<Type>> {
        let name = self
            .attr_string(die, "DW_TAG_base_type", gimli::DW_AT_name)?
            .ok_or_else(|| {
                Error::Other("DW_TAG_base_type has missing or invalid DW_AT_name".to_string())
            })?;
        let encoding = self.attr_encoding(die)?.ok_or_else(|| {
            Error::Other("DW_TAG_base_type has missing or invalid DW_AT_encoding".to_string())
        })?;
        let size = self
            .attr_udata(die, "DW_TAG_base_type", gimli::DW_AT_byte_size)?
            .ok_or_else(|| {
                Error::Other("DW_TAG_base_type has missing or invalid DW_AT_byte_size".to_string())
            })?;

        let kind = match encoding {
            gimli::DW_ATE_boolean => TypeKind::Bool { name, size },
            gimli::DW_ATE_float => TypeKind::Float { name, size },
            gimli::DW_ATE_signed | gimli::DW_ATE_signed_char => TypeKind::Int {
                name,
                size,
                is_signed: true,
            },
            gimli::DW_ATE_unsigned | gimli::DW_ATE_unsigned_char => TypeKind::Int {
                name,
                size,
                is_signed: false,
            },
            gimli::DW_ATE_complex_float => {
                let child = self.attr_type_die(die, "DW_TAG_base_type")?.ok_or_else(|| {
                    Error::Other(
                        "DW_TAG_base_type has missing or invalid DW_AT_type".to_string(),
                    )
                })?;
                let (real, _) = self.resolve_internal(child, true)?;
                if !matches!(
                    real.ty.kind(),
                    TypeKind::Float { .. } | TypeKind::Int { .. }
                ) {
                    return Err(Error::Other(
                        "DW_AT_type of DW_ATE_complex_float is not a floating-point or integer type"
                            .to_string(),
                    ));
                }
                TypeKind::Complex {
                    name,
                    size,
                    real: real.ty,
                }
            }
            // GCCは複素整数型も出力するが、DWARF 4にエンコーディングがなく
            // GCC 8.2時点のDW_ATE_lo_userは多義的なため対応しない
            _ => {
                return Err(Error::Other(format!(
                    "DW_TAG_base_type has unknown DWARF encoding {:#x}",
                    encoding.0
                )))
            }
        };
        Ok(Type::new(kind, language))
    }

    /// 前方宣言に対応する唯一の完全な定義を索引から探す
    ///
    /// 候補が0件または2件以上のときはStopを返し、呼び出し側は
    /// 不完全型として扱います。
    fn find_complete(&self, tag: gimli::DwTag, name: &str) -> Result<Rc<Type>> {
        let mut candidates = self
            .index()
            .entries(name)
            .iter()
            .filter(|entry| entry.tag == tag);
        let first = match candidates.next() {
            Some(entry) => entry.die,
            None => return Err(Error::Stop),
        };
        // 2件目があれば確定できないため、推測せずに諦める
        if candidates.next().is_some() {
            return Err(Error::Stop);
        }
        let qualified = self.type_from_die(first)?;
        Ok(qualified.ty)
    }

    /// DW_TAG_structure_type / DW_TAG_union_type / DW_TAG_class_type
    pub(crate) fn compound_type_from_die(
        &self,
        die: DieRef,
        language: Language,
        kind: CompoundKind,
    ) -> Result<Rc<Type>> {
        let (dw_tag, tag_name) = match kind {
            CompoundKind::Struct => (gimli::DW_TAG_structure_type, "DW_TAG_structure_type"),
            CompoundKind::Union => (gimli::DW_TAG_union_type, "DW_TAG_union_type"),
            CompoundKind::Class => (gimli::DW_TAG_class_type, "DW_TAG_class_type"),
        };

        let tag = self.attr_string(die, tag_name, gimli::DW_AT_name)?;
        let declaration = self.attr_flag(die, tag_name, gimli::DW_AT_declaration)?;
        if declaration {
            if let Some(tag) = &tag {
                match self.find_complete(dw_tag, tag) {
                    Ok(ty) => return Ok(ty),
                    Err(Error::Stop) => {}
                    Err(err) => return Err(err),
                }
            }
            return Ok(Type::new(
                TypeKind::Compound {
                    kind,
                    tag,
                    size: 0,
                    members: Vec::new(),
                    is_complete: false,
                },
                language,
            ));
        }

        let size = self
            .attr_udata(die, tag_name, gimli::DW_AT_byte_size)?
            .ok_or_else(|| {
                Error::Other(format!(
                    "{} has missing or invalid DW_AT_byte_size",
                    tag_name
                ))
            })?;

        // メンバのビット位置はELF側のエンディアンで決まる。複合型DIEの
        // DW_AT_endianityは参照しない
        let little_endian = self.die_is_little_endian(die, false)?;

        let mut members = Vec::new();
        // 末尾のメンバだけ不完全配列の扱いが異なるため、1つ先読みする
        let mut pending: Option<DieRef> = None;
        for (child_tag, child) in self.die_children(die)? {
            if child_tag != gimli::DW_TAG_member {
                continue;
            }
            if let Some(previous) = pending.replace(child) {
                self.parse_member(previous, little_endian, false, &mut members)?;
            }
        }
        if let Some(last) = pending {
            // 可変長配列メンバは、他のメンバを1つ以上持つ構造体の
            // 末尾でのみ許される
            let can_be_incomplete_array = kind != CompoundKind::Union && !members.is_empty();
            self.parse_member(last, little_endian, can_be_incomplete_array, &mut members)?;
        }

        Ok(Type::new(
            TypeKind::Compound {
                kind,
                tag,
                size,
                members,
                is_complete: true,
            },
            language,
        ))
    }

    fn parse_member(
        &self,
        die: DieRef,
        little_endian: bool,
        can_be_incomplete_array: bool,
        members: &mut Vec<Member>,
    ) -> Result<()> {
        let name = self.attr_string(die, "DW_TAG_member", gimli::DW_AT_name)?;
        let bit_field_size = self
            .attr_udata(die, "DW_TAG_member", gimli::DW_AT_bit_size)?
            .unwrap_or(0);
        let ty = self.lazy_type_from_die(die, "DW_TAG_member", can_be_incomplete_array)?;
        let bit_offset = self.parse_member_offset(die, &ty, bit_field_size, little_endian)?;
        members.push(Member {
            name,
            ty,
            bit_offset,
            bit_field_size,
        });
        Ok(())
    }

    /// メンバのビットオフセットを計算する
    ///
    /// DW_AT_data_bit_offsetがあればそれが包含オブジェクト先頭からの
    /// ビット位置そのもの。なければDW_AT_data_member_location(バイト単位)を
    /// 基点に、DWARF 3以前のDW_AT_bit_offsetを加味する。DW_AT_bit_offsetは
    /// 包含オブジェクトの最上位ビットからの位置なので、リトルエンディアン
    /// ではメンバのサイズから折り返して先頭位置を求める。
    fn parse_member_offset(
        &self,
        die: DieRef,
        member_type: &LazyType,
        bit_field_size: u64,
        little_endian: bool,
    ) -> Result<u64> {
        if let Some(bit_offset) =
            self.attr_udata(die, "DW_TAG_member", gimli::DW_AT_data_bit_offset)?
        {
            return Ok(bit_offset);
        }

        let mut offset = match self
            .attr_udata(die, "DW_TAG_member", gimli::DW_AT_data_member_location)?
        {
            Some(byte_offset) => 8 * byte_offset,
            None => 0,
        };

        if let Some(bit_offset) = self.attr_udata(die, "DW_TAG_member", gimli::DW_AT_bit_offset)? {
            if little_endian {
                // メンバ自身のDW_AT_byte_sizeがあればそれを、なければ
                // メンバの型のサイズを使う
                let byte_size =
                    match self.attr_udata(die, "DW_TAG_member", gimli::DW_AT_byte_size)? {
                        Some(size) => size,
                        None => {
                            let member = member_type.evaluate(self)?;
                            member.ty.byte_size().ok_or_else(|| {
                                Error::Other(
                                    "DW_TAG_member bit field type does not have size".to_string(),
                                )
                            })?
                        }
                    };
                let from_msb = 8u64
                    .checked_mul(byte_size)
                    .and_then(|bits| bits.checked_sub(bit_offset))
                    .and_then(|bits| bits.checked_sub(bit_field_size))
                    .ok_or(Error::Overflow("DW_AT_bit_offset is out of range"))?;
                offset += from_msb;
            } else {
                offset += bit_offset;
            }
        }
        Ok(offset)
    }

    /// DW_TAG_enumeration_type
    pub(crate) fn enum_type_from_die(&self, die: DieRef, language: Language) -> Result<Rc<Type>> {
        let tag = self.attr_string(die, "DW_TAG_enumeration_type", gimli::DW_AT_name)?;
        let declaration =
            self.attr_flag(die, "DW_TAG_enumeration_type", gimli::DW_AT_declaration)?;
        if declaration {
            if let Some(tag) = &tag {
                match self.find_complete(gimli::DW_TAG_enumeration_type, tag) {
                    Ok(ty) => return Ok(ty),
                    Err(Error::Stop) => {}
                    Err(err) => return Err(err),
                }
            }
            return Ok(Type::new(
                TypeKind::Enum {
                    tag,
                    compatible: None,
                    enumerators: Vec::new(),
                    is_complete: false,
                },
                language,
            ));
        }

        let mut enumerators = Vec::new();
        let mut is_signed = false;
        for (child_tag, child) in self.die_children(die)? {
            if child_tag == gimli::DW_TAG_enumerator {
                self.parse_enumerator(child, &mut enumerators, &mut is_signed)?;
            }
        }

        let compatible = match self.attr_type_die(die, "DW_TAG_enumeration_type")? {
            Some(child) => {
                let (qualified, _) = self.resolve_internal(child, true)?;
                if !matches!(qualified.ty.kind(), TypeKind::Int { .. }) {
                    return Err(Error::Other(
                        "DW_AT_type of DW_TAG_enumeration_type is not an integer type"
                            .to_string(),
                    ));
                }
                qualified.ty
            }
            // GCC 5.1より前は列挙型にDW_AT_typeを出力しないため、
            // 互換整数型を捏造する
            None => self.enum_compatible_type_fallback(die, is_signed, language)?,
        };

        Ok(Type::new(
            TypeKind::Enum {
                tag,
                compatible: Some(compatible),
                enumerators,
                is_complete: true,
            },
            language,
        ))
    }

    fn parse_enumerator(
        &self,
        die: DieRef,
        enumerators: &mut Vec<Enumerator>,
        is_signed: &mut bool,
    ) -> Result<()> {
        let name = self
            .attr_string(die, "DW_TAG_enumerator", gimli::DW_AT_name)?
            .ok_or_else(|| {
                Error::Other("DW_TAG_enumerator has missing or invalid DW_AT_name".to_string())
            })?;
        let attr = self
            .attr_integrate(die, gimli::DW_AT_const_value)?
            .ok_or_else(|| {
                Error::Other("DW_TAG_enumerator is missing DW_AT_const_value".to_string())
            })?;
        // フォームが符号付きなら符号付きの値として記録する。GCC 7.1より前は
        // 列挙型にDW_AT_encodingが無いため、負の値を見て符号を推測する
        let value = match attr.value() {
            gimli::AttributeValue::Sdata(value) => {
                if value < 0 {
                    *is_signed = true;
                }
                EnumValue::Signed(value)
            }
            other => match other.udata_value() {
                Some(value) => EnumValue::Unsigned(value),
                None => {
                    return Err(Error::Other(
                        "DW_TAG_enumerator has invalid DW_AT_const_value".to_string(),
                    ))
                }
            },
        };
        enumerators.push(Enumerator { name, value });
        Ok(())
    }

    fn enum_compatible_type_fallback(
        &self,
        die: DieRef,
        is_signed: bool,
        language: Language,
    ) -> Result<Rc<Type>> {
        let size = self
            .attr_udata(die, "DW_TAG_enumeration_type", gimli::DW_AT_byte_size)?
            .ok_or_else(|| {
                Error::Other(
                    "DW_TAG_enumeration_type has missing or invalid DW_AT_byte_size".to_string(),
                )
            })?;
        Ok(Type::new(
            TypeKind::Int {
                name: "<unknown>".to_string(),
                size,
                is_signed,
            },
            language,
        ))
    }

    /// DW_TAG_typedef
    ///
    /// 不完全配列の別名はその印ごと呼び出し元へ伝播します。
    pub(crate) fn typedef_type_from_die(
        &self,
        die: DieRef,
        language: Language,
        can_be_incomplete_array: bool,
    ) -> Result<(Rc<Type>, bool)> {
        let name = self
            .attr_string(die, "DW_TAG_typedef", gimli::DW_AT_name)?
            .ok_or_else(|| {
                Error::Other("DW_TAG_typedef has missing or invalid DW_AT_name".to_string())
            })?;
        let (aliased, is_incomplete_array) = self.type_from_child(
            die,
            "DW_TAG_typedef",
            language,
            true,
            can_be_incomplete_array,
        )?;
        Ok((
            Type::new(TypeKind::Typedef { name, aliased }, language),
            is_incomplete_array,
        ))
    }

    /// DW_TAG_pointer_type
    pub(crate) fn pointer_type_from_die(
        &self,
        die: DieRef,
        language: Language,
    ) -> Result<Rc<Type>> {
        let (referenced, _) =
            self.type_from_child(die, "DW_TAG_pointer_type", language, true, true)?;
        let size = match self.attr_udata(die, "DW_TAG_pointer_type", gimli::DW_AT_byte_size)? {
            Some(size) => size,
            None => u64::from(self.program().word_size),
        };
        Ok(Type::new(TypeKind::Pointer { referenced, size }, language))
    }

    /// DW_TAG_array_type
    pub(crate) fn array_type_from_die(
        &self,
        die: DieRef,
        language: Language,
        can_be_incomplete_array: bool,
    ) -> Result<(Rc<Type>, bool)> {
        let mut dimensions = Vec::new();
        for (child_tag, child) in self.die_children(die)? {
            if child_tag == gimli::DW_TAG_subrange_type {
                dimensions.push(self.subrange_length(child)?);
            }
        }
        if dimensions.is_empty() {
            dimensions.push(ArrayDimension {
                length: 0,
                is_complete: false,
            });
        }

        let (element, _) = self.type_from_child(die, "DW_TAG_array_type", language, false, false)?;

        let is_incomplete_array = !dimensions[0].is_complete;

        // 内側の次元から外へ向かって組み立てる。不完全なまま残してよいのは
        // 最外の次元だけで、それも呼び出し元が許した場合に限る。それ以外の
        // 不完全な次元は長さ0の配列に置き換える
        let mut element = element;
        for (i, dimension) in dimensions.iter().enumerate().rev() {
            let length = if dimension.is_complete {
                Some(dimension.length)
            } else if i > 0 || !can_be_incomplete_array {
                Some(0)
            } else {
                None
            };
            let ty = Type::new(TypeKind::Array { element, length }, language);
            element = QualifiedType::unqualified(ty);
        }
        Ok((element.ty, is_incomplete_array))
    }

    fn subrange_length(&self, die: DieRef) -> Result<ArrayDimension> {
        let (attr_name, attr) = match self.attr_integrate(die, gimli::DW_AT_upper_bound)? {
            Some(attr) => (gimli::DW_AT_upper_bound, attr),
            None => match self.attr_integrate(die, gimli::DW_AT_count)? {
                Some(attr) => (gimli::DW_AT_count, attr),
                None => {
                    return Ok(ArrayDimension {
                        length: 0,
                        is_complete: false,
                    })
                }
            },
        };

        // GCCは明示的なサイズのない空配列(`int arr[] = {};`)に
        // DW_FORM_sdataで-1のDW_AT_upper_boundを出力する
        if attr_name == gimli::DW_AT_upper_bound {
            if let gimli::AttributeValue::Sdata(-1) = attr.value() {
                return Ok(ArrayDimension {
                    length: 0,
                    is_complete: true,
                });
            }
        }

        let word = match attr.udata_value() {
            Some(word) => word,
            None => {
                return Err(Error::Other(format!(
                    "DW_TAG_subrange_type has invalid {}",
                    attr_name
                )))
            }
        };
        let length = if attr_name == gimli::DW_AT_upper_bound {
            word.checked_add(1)
                .ok_or(Error::Overflow("DW_AT_upper_bound is too large"))?
        } else {
            word
        };
        Ok(ArrayDimension {
            length,
            is_complete: true,
        })
    }

    /// DW_TAG_subroutine_type / DW_TAG_subprogram
    pub(crate) fn function_type_from_die(
        &self,
        die: DieRef,
        language: Language,
        tag_name: &str,
    ) -> Result<Rc<Type>> {
        let mut parameters = Vec::new();
        let mut is_variadic = false;
        for (child_tag, child) in self.die_children(die)? {
            match child_tag {
                gimli::DW_TAG_formal_parameter => {
                    if is_variadic {
                        return Err(Error::Other(format!(
                            "{} has DW_TAG_formal_parameter child after DW_TAG_unspecified_parameters child",
                            tag_name
                        )));
                    }
                    let name =
                        self.attr_string(child, "DW_TAG_formal_parameter", gimli::DW_AT_name)?;
                    let ty = self.lazy_type_from_die(child, "DW_TAG_formal_parameter", true)?;
                    parameters.push(Parameter { name, ty });
                }
                gimli::DW_TAG_unspecified_parameters => {
                    if is_variadic {
                        return Err(Error::Other(format!(
                            "{} has multiple DW_TAG_unspecified_parameters children",
                            tag_name
                        )));
                    }
                    is_variadic = true;
                }
                _ => {}
            }
        }

        let (return_type, _) = self.type_from_child(die, tag_name, language, true, true)?;
        Ok(Type::new(
            TypeKind::Function {
                return_type,
                parameters,
                is_variadic,
            },
            language,
        ))
    }
}
