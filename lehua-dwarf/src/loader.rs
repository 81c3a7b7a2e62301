//! ELFとDWARFの読み込み
//!
//! ELFファイルからDWARFセクションを読み込み、型解決に必要な
//! プログラム情報(ワードサイズ・バイトオーダー・既定言語)を導出します。

use std::fs;
use std::path::Path;

use object::{Object, ObjectKind, ObjectSection};
use tracing::debug;

use crate::error::Error;
use crate::types::{ByteOrder, Language};
use crate::Result;

/// 解析対象プログラムの基本情報
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramInfo {
    /// ポインタのバイト数
    pub word_size: u8,
    /// ELFヘッダのデータエンコーディング由来のバイトオーダー
    pub byte_order: ByteOrder,
    /// DW_AT_languageが未知または欠落している場合に使う言語
    pub default_language: Language,
}

/// DWARFローダー
pub struct DwarfLoader {
    /// オブジェクトファイル
    object_file: object::File<'static>,
    /// DWARFコンテキスト
    dwarf: gimli::Dwarf<gimli::EndianSlice<'static, gimli::RunTimeEndian>>,
    program: ProgramInfo,
}

impl DwarfLoader {
    /// ELFファイルからDWARF情報を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file_data = fs::read(path)
            .map_err(|e| Error::Other(format!("failed to read file {:?}: {}", path, e)))?;

        // セクションスライスに'staticライフタイムを与えるためリークする。
        // 解放はプロセス終了時にまとめて行われる
        let file_data: &'static [u8] = Box::leak(file_data.into_boxed_slice());

        let object_file = object::File::parse(file_data)
            .map_err(|e| Error::Other(format!("failed to parse ELF file {:?}: {}", path, e)))?;

        let endian = if object_file.is_little_endian() {
            gimli::RunTimeEndian::Little
        } else {
            gimli::RunTimeEndian::Big
        };

        // DWARFセクションを読み込む。存在しないセクションは空として扱う
        let load_section = |id: gimli::SectionId| -> std::result::Result<
            gimli::EndianSlice<'static, gimli::RunTimeEndian>,
            gimli::Error,
        > {
            let data = object_file
                .section_by_name(id.name())
                .and_then(|section| section.data().ok())
                .unwrap_or(&[]);
            Ok(gimli::EndianSlice::new(data, endian))
        };
        let dwarf = gimli::Dwarf::load(load_section)?;

        let program = ProgramInfo {
            word_size: if object_file.is_64() { 8 } else { 4 },
            byte_order: if object_file.is_little_endian() {
                ByteOrder::Little
            } else {
                ByteOrder::Big
            },
            default_language: Language::C,
        };
        debug!(
            "loaded DWARF sections from {:?} (word size {})",
            path, program.word_size
        );

        Ok(Self {
            object_file,
            dwarf,
            program,
        })
    }

    /// DWARFコンテキストへの参照を取得
    pub fn dwarf(&self) -> &gimli::Dwarf<gimli::EndianSlice<'static, gimli::RunTimeEndian>> {
        &self.dwarf
    }

    /// オブジェクトファイルへの参照を取得
    pub fn object_file(&self) -> &object::File<'static> {
        &self.object_file
    }

    /// プログラムの基本情報を取得
    pub fn program(&self) -> ProgramInfo {
        self.program
    }

    /// PIE(Position Independent Executable)かどうかを判定する
    ///
    /// PIE実行ファイルではデバッグ情報中のアドレスがオフセットであり、
    /// 実行時ベースアドレスをロードバイアスとして加算する必要があります。
    pub fn is_pie(&self) -> bool {
        // ET_DYN = PIE実行ファイルまたは共有ライブラリ
        matches!(self.object_file.kind(), ObjectKind::Dynamic)
    }
}
