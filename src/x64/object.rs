//! Relocatable object files for compiled kernels.
//!
//! The kernel goes into a single `.text` section with one global function
//! symbol. Constant-pool addresses inside the code are absolute fixups; they
//! become 64-bit absolute relocations against the section so a linker can
//! place the code anywhere.

use object::write::{Object, Relocation, StandardSection, Symbol, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationEncoding, RelocationFlags, RelocationKind,
    SymbolFlags, SymbolKind, SymbolScope,
};

use super::assembler::CodeBuffer;
use crate::core::config::ObjectFormat;
use crate::core::error::{CompileError, CompileResult};

fn object_error(e: impl std::fmt::Display) -> CompileError {
    CompileError::ObjectFile {
        reason: e.to_string(),
    }
}

/// Serialize `code` as an object file exporting `symbol`.
pub fn write_object(code: &CodeBuffer, format: ObjectFormat, symbol: &str) -> CompileResult<Vec<u8>> {
    let binary_format = match format {
        ObjectFormat::Elf => BinaryFormat::Elf,
        ObjectFormat::Coff => BinaryFormat::Coff,
    };
    let mut obj = Object::new(binary_format, Architecture::X86_64, Endianness::Little);
    let text = obj.section_id(StandardSection::Text);
    let offset = obj.append_section_data(text, code.bytes(), 16);

    obj.add_symbol(Symbol {
        name: symbol.as_bytes().to_vec(),
        value: offset,
        size: code.len() as u64,
        kind: SymbolKind::Text,
        scope: SymbolScope::Linkage,
        weak: false,
        section: SymbolSection::Section(text),
        flags: SymbolFlags::None,
    });

    let relocations = code.relocations()?;
    if !relocations.is_empty() {
        let section_symbol = obj.section_symbol(text);
        for (site, target) in relocations {
            obj.add_relocation(
                text,
                Relocation {
                    offset: offset + site as u64,
                    symbol: section_symbol,
                    addend: (offset + target as u64) as i64,
                    flags: RelocationFlags::Generic {
                        kind: RelocationKind::Absolute,
                        encoding: RelocationEncoding::Generic,
                        size: 64,
                    },
                },
            )
            .map_err(object_error)?;
        }
    }

    let bytes = obj.write().map_err(object_error)?;
    log::debug!(
        "wrote {:?} object with {} bytes of code as {symbol}",
        format,
        code.len()
    );
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::{Object as _, ObjectSection, ObjectSymbol};

    fn sample() -> CodeBuffer {
        let mut buf = CodeBuffer::new();
        let pool = buf.create_label();
        // mov r11, imm64; movaps xmm0, [r11]; ret
        buf.emit(&[0x49, 0xBB, 0, 0, 0, 0, 0, 0, 0, 0]);
        buf.reference_absolute(2, pool);
        buf.emit(&[0x41, 0x0F, 0x28, 0x03, 0xC3]);
        buf.align(16, 0xCC);
        buf.bind(pool).unwrap();
        buf.emit(&[0; 16]);
        buf
    }

    #[test]
    fn test_elf_text_and_symbol() {
        let code = sample();
        let bytes = write_object(&code, ObjectFormat::Elf, "kernel").unwrap();
        let file = object::File::parse(bytes.as_slice()).unwrap();
        assert_eq!(file.format(), BinaryFormat::Elf);

        let text = file.section_by_name(".text").unwrap();
        assert_eq!(text.data().unwrap(), code.bytes());

        let symbol = file.symbols().find(|s| s.name() == Ok("kernel")).unwrap();
        assert!(symbol.is_global());
        assert_eq!(symbol.size(), code.len() as u64);

        let relocations: Vec<_> = text.relocations().collect();
        assert_eq!(relocations.len(), 1);
        let (site, reloc) = &relocations[0];
        assert_eq!(*site, 2);
        assert_eq!(reloc.kind(), RelocationKind::Absolute);
        assert_eq!(reloc.size(), 64);
        assert_eq!(reloc.addend(), 16);
    }

    #[test]
    fn test_coff_object() {
        let code = sample();
        let bytes = write_object(&code, ObjectFormat::Coff, "kernel").unwrap();
        let file = object::File::parse(bytes.as_slice()).unwrap();
        assert_eq!(file.format(), BinaryFormat::Coff);
        assert!(file.symbols().any(|s| s.name() == Ok("kernel")));
        let text = file.section_by_name(".text").unwrap();
        assert_eq!(text.relocations().count(), 1);
    }

    #[test]
    fn test_unbound_label_rejected() {
        let mut buf = CodeBuffer::new();
        let missing = buf.create_label();
        buf.emit(&[0x0F, 0x8E, 0, 0, 0, 0]);
        buf.reference_relative(2, missing).unwrap();
        assert!(write_object(&buf, ObjectFormat::Elf, "kernel").is_err());
    }
}
