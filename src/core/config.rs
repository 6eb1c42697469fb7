//! Compiler options.
//!
//! The crate is a library, so configuration is a plain value passed to the
//! driver. Defaults follow the host platform.

/// Calling convention the generated function follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abi {
    /// System V AMD64 (Linux, macOS, BSDs).
    SysV,
    /// Microsoft x64.
    Win64,
}

impl Abi {
    pub fn host() -> Self {
        if cfg!(windows) {
            Abi::Win64
        } else {
            Abi::SysV
        }
    }
}

/// Container format of the emitted object file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectFormat {
    Elf,
    Coff,
}

impl ObjectFormat {
    pub fn host() -> Self {
        if cfg!(windows) {
            ObjectFormat::Coff
        } else {
            ObjectFormat::Elf
        }
    }
}

/// Options controlling one compilation.
#[derive(Debug, Clone)]
pub struct CompilerOptions {
    pub abi: Abi,
    pub object_format: ObjectFormat,
    /// Serialize an object file next to the executable code.
    pub emit_object: bool,
    /// Upper bound accepted for a variable's unroll factor.
    pub max_unroll: u32,
    /// Symbol name of the generated function in the object file.
    pub symbol_name: String,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            abi: Abi::host(),
            object_format: ObjectFormat::host(),
            emit_object: true,
            max_unroll: 16,
            symbol_name: "arrayjit_kernel".to_string(),
        }
    }
}

impl CompilerOptions {
    pub fn with_abi(mut self, abi: Abi) -> Self {
        self.abi = abi;
        self
    }

    pub fn with_object_format(mut self, format: ObjectFormat) -> Self {
        self.object_format = format;
        self
    }

    pub fn with_emit_object(mut self, emit: bool) -> Self {
        self.emit_object = emit;
        self
    }

    pub fn with_max_unroll(mut self, max_unroll: u32) -> Self {
        self.max_unroll = max_unroll;
        self
    }

    pub fn with_symbol_name(mut self, name: impl Into<String>) -> Self {
        self.symbol_name = name.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_host() {
        let options = CompilerOptions::default();
        assert_eq!(options.abi, Abi::host());
        assert_eq!(options.object_format, ObjectFormat::host());
        assert!(options.emit_object);
    }

    #[test]
    fn test_builder_methods() {
        let options = CompilerOptions::default()
            .with_abi(Abi::Win64)
            .with_object_format(ObjectFormat::Coff)
            .with_symbol_name("blur");
        assert_eq!(options.abi, Abi::Win64);
        assert_eq!(options.object_format, ObjectFormat::Coff);
        assert_eq!(options.symbol_name, "blur");
    }
}
