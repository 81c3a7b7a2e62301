//! プログラムオブジェクトの解決
//!
//! 名前から列挙定数・関数・変数を型付きの値として引き当てます。
//! 関数と静的アドレスを持つ変数はメモリへの参照に、列挙定数と
//! DW_AT_const_valueを持つ変数はデバッグ情報に埋め込まれた値になります。

use gimli::Reader;

use crate::cache::TypeCache;
use crate::error::Error;
use crate::types::{ByteOrder, DieRef, EnumValue, QualifiedType, TypeKind};
use crate::Result;

/// 検索対象のオブジェクト種別の集合
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObjectFlags(u8);

impl ObjectFlags {
    /// 列挙定数
    pub const CONSTANT: ObjectFlags = ObjectFlags(1 << 0);
    /// 関数
    pub const FUNCTION: ObjectFlags = ObjectFlags(1 << 1);
    /// 変数
    pub const VARIABLE: ObjectFlags = ObjectFlags(1 << 2);
    /// すべての種別
    pub const ANY: ObjectFlags = ObjectFlags(0b111);

    pub fn contains(self, other: ObjectFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for ObjectFlags {
    type Output = ObjectFlags;

    fn bitor(self, rhs: ObjectFlags) -> ObjectFlags {
        ObjectFlags(self.0 | rhs.0)
    }
}

/// オブジェクトの値
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectValue {
    Signed(i64),
    Unsigned(u64),
    /// 生のバイト列
    Bytes {
        bytes: Vec<u8>,
        byte_order: ByteOrder,
    },
}

/// 解決されたプログラムオブジェクト
#[derive(Debug, Clone)]
pub enum Object {
    /// メモリ上の実体への参照
    Reference {
        ty: QualifiedType,
        /// ロードバイアス適用済みの絶対アドレス
        address: u64,
        bit_offset: u64,
        byte_order: ByteOrder,
    },
    /// デバッグ情報に埋め込まれた値
    Value { ty: QualifiedType, value: ObjectValue },
}

/// 値の解釈の仕方
enum ValueKind {
    Signed,
    Unsigned,
    Float,
    Buffer,
}

/// オブジェクトリゾルバ
pub struct ObjectResolver<'a, 'd, R: Reader<Offset = usize>> {
    cache: &'a TypeCache<'d, R>,
}

impl<'a, 'd, R: Reader<Offset = usize>> ObjectResolver<'a, 'd, R> {
    /// 型キャッシュからオブジェクトリゾルバを作成する
    pub fn new(cache: &'a TypeCache<'d, R>) -> Self {
        Self { cache }
    }

    /// 名前からオブジェクトを検索する
    ///
    /// # Arguments
    /// * `name` - オブジェクト名
    /// * `filename` - コンパイルユニットのファイルパスによるフィルタ
    /// * `flags` - 検索対象の種別。空は契約違反
    ///
    /// 候補が無ければNotFoundを返します。最初に一致した候補の解決に
    /// 失敗した場合はそのエラーを返し、次の候補は試しません。
    pub fn find(&self, name: &str, filename: Option<&str>, flags: ObjectFlags) -> Result<Object> {
        if flags.is_empty() {
            return Err(Error::InvalidArgument("no object kinds requested"));
        }
        let mut tags = Vec::new();
        if flags.contains(ObjectFlags::CONSTANT) {
            tags.push(gimli::DW_TAG_enumerator);
        }
        if flags.contains(ObjectFlags::FUNCTION) {
            tags.push(gimli::DW_TAG_subprogram);
        }
        if flags.contains(ObjectFlags::VARIABLE) {
            tags.push(gimli::DW_TAG_variable);
        }

        for entry in self.cache.index().entries(name) {
            if !tags.contains(&entry.tag)
                || !self.cache.die_matches_filename(entry.die, filename)
            {
                continue;
            }
            return match entry.tag {
                gimli::DW_TAG_enumerator => self.from_enumerator(entry.die, name),
                gimli::DW_TAG_subprogram => self.from_subprogram(entry.die, entry.bias, name),
                gimli::DW_TAG_variable => self.from_variable(entry.die, entry.bias, name),
                _ => Err(Error::Other(format!("unexpected index tag {}", entry.tag))),
            };
        }
        Err(Error::NotFound)
    }

    /// 列挙定数。索引のDIEは親の列挙型を指す
    fn from_enumerator(&self, die: DieRef, name: &str) -> Result<Object> {
        let ty = self.cache.type_from_die(die)?;
        let (enumerators, is_signed) = match ty.ty.kind() {
            TypeKind::Enum {
                enumerators,
                compatible,
                ..
            } => {
                let is_signed = matches!(
                    compatible.as_ref().map(|c| c.kind()),
                    Some(TypeKind::Int {
                        is_signed: true,
                        ..
                    })
                );
                (enumerators, is_signed)
            }
            _ => {
                return Err(Error::Other(
                    "indexed enumerator does not belong to an enumeration type".to_string(),
                ))
            }
        };
        for enumerator in enumerators {
            if enumerator.name != name {
                continue;
            }
            // 値は互換整数型の符号で解釈する
            let value = if is_signed {
                ObjectValue::Signed(match enumerator.value {
                    EnumValue::Signed(value) => value,
                    EnumValue::Unsigned(value) => value as i64,
                })
            } else {
                ObjectValue::Unsigned(match enumerator.value {
                    EnumValue::Signed(value) => value as u64,
                    EnumValue::Unsigned(value) => value,
                })
            };
            return Ok(Object::Value {
                ty: ty.clone(),
                value,
            });
        }
        Err(Error::Lookup(format!(
            "could not find enumerator '{}'",
            name
        )))
    }

    fn from_subprogram(&self, die: DieRef, bias: u64, name: &str) -> Result<Object> {
        let ty = self.cache.type_from_die(die)?;
        let low_pc = match self.cache.attr_low_pc(die)? {
            Some(address) => address,
            None => {
                return Err(Error::Lookup(format!(
                    "could not find address of '{}'",
                    name
                )))
            }
        };
        let byte_order = self.cache.die_byte_order(die, false)?;
        Ok(Object::Reference {
            ty,
            address: low_pc.wrapping_add(bias),
            bit_offset: 0,
            byte_order,
        })
    }

    fn from_variable(&self, die: DieRef, bias: u64, name: &str) -> Result<Object> {
        let language = self.cache.language_of_die(die);
        let (ty, _) = self
            .cache
            .type_from_child(die, "DW_TAG_variable", language, true, true)?;

        if let Some(address) = self.cache.attr_location_address(die)? {
            let byte_order = self.cache.die_byte_order(die, true)?;
            return Ok(Object::Reference {
                ty,
                address: address.wrapping_add(bias),
                bit_offset: 0,
                byte_order,
            });
        }
        match self.cache.attr_integrate(die, gimli::DW_AT_const_value)? {
            Some(attr) => self.from_constant(die, ty, attr),
            None => Err(Error::Lookup(format!(
                "could not find address or value of '{}'",
                name
            ))),
        }
    }

    /// DW_AT_const_valueから値オブジェクトを作る
    fn from_constant(
        &self,
        die: DieRef,
        ty: QualifiedType,
        attr: gimli::Attribute<R>,
    ) -> Result<Object> {
        let (kind, bit_size) = value_kind(&ty)?;

        if let gimli::AttributeValue::Block(block) = attr.value() {
            let little_endian = self.cache.die_is_little_endian(die, true)?;
            let bytes = block.to_slice()?;
            let size = ((bit_size + 7) / 8) as usize;
            if bytes.len() < size {
                return Err(Error::Other(
                    "DW_AT_const_value block is too small".to_string(),
                ));
            }
            let byte_order = if little_endian {
                ByteOrder::Little
            } else {
                ByteOrder::Big
            };
            return Ok(Object::Value {
                ty,
                value: ObjectValue::Bytes {
                    bytes: bytes[..size].to_vec(),
                    byte_order,
                },
            });
        }

        if matches!(kind, ValueKind::Signed | ValueKind::Unsigned) && bit_size > 64 {
            return Err(Error::Other("DW_AT_const_value is too large".to_string()));
        }
        match kind {
            ValueKind::Signed => match attr.sdata_value() {
                Some(value) => Ok(Object::Value {
                    ty,
                    value: ObjectValue::Signed(truncate_signed(value, bit_size)),
                }),
                None => Err(Error::Other("invalid DW_AT_const_value".to_string())),
            },
            ValueKind::Unsigned => match attr.udata_value() {
                Some(value) => Ok(Object::Value {
                    ty,
                    value: ObjectValue::Unsigned(truncate_unsigned(value, bit_size)),
                }),
                None => Err(Error::Other("invalid DW_AT_const_value".to_string())),
            },
            ValueKind::Float | ValueKind::Buffer => Err(Error::Other(
                "unknown DW_AT_const_value form".to_string(),
            )),
        }
    }
}

/// 型が値としてどう解釈されるかと、そのビット幅
fn value_kind(ty: &QualifiedType) -> Result<(ValueKind, u64)> {
    let underlying = ty.ty.underlying();
    let kind = match underlying.kind() {
        TypeKind::Int { is_signed, .. } => {
            if *is_signed {
                ValueKind::Signed
            } else {
                ValueKind::Unsigned
            }
        }
        TypeKind::Bool { .. } => ValueKind::Unsigned,
        TypeKind::Float { .. } => ValueKind::Float,
        TypeKind::Pointer { .. } => ValueKind::Unsigned,
        TypeKind::Enum {
            compatible: Some(compatible),
            ..
        } => match compatible.kind() {
            TypeKind::Int {
                is_signed: true, ..
            } => ValueKind::Signed,
            _ => ValueKind::Unsigned,
        },
        TypeKind::Complex { .. } => ValueKind::Buffer,
        TypeKind::Compound {
            is_complete: true, ..
        }
        | TypeKind::Array {
            length: Some(_), ..
        } => ValueKind::Buffer,
        _ => {
            return Err(Error::Other(
                "cannot create object with incomplete or sizeless type".to_string(),
            ))
        }
    };
    let bit_size = underlying
        .byte_size()
        .and_then(|size| size.checked_mul(8))
        .ok_or_else(|| {
            Error::Other("cannot create object with incomplete or sizeless type".to_string())
        })?;
    Ok((kind, bit_size))
}

/// 値を型のビット幅に符号拡張付きで切り詰める
fn truncate_signed(value: i64, bit_size: u64) -> i64 {
    if bit_size >= 64 {
        return value;
    }
    let shift = (64 - bit_size) as u32;
    (value << shift) >> shift
}

/// 値を型のビット幅に切り詰める
fn truncate_unsigned(value: u64, bit_size: u64) -> u64 {
    if bit_size >= 64 {
        return value;
    }
    value & ((1u64 << bit_size) - 1)
}
