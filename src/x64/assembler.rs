//! Byte buffer with labels and fixups.
//!
//! A label records the offset it is bound to. References to a label that is
//! not bound yet are remembered as fixup sites and patched when the label is
//! bound. Relative fixups hold a rel32 measured from the end of the
//! instruction; absolute fixups hold a 64-bit address that is only known once
//! the code is placed in memory, so they stay in the buffer's relocation list
//! and are resolved by [`CodeBuffer::link`].

use crate::core::error::{CompileError, CompileResult};

/// Handle to a label of a [`CodeBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupKind {
    /// rel32 relative to the next instruction, 4 bytes.
    Relative,
    /// Absolute address of the label, 8 bytes.
    Absolute,
}

/// Patch site waiting for a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fixup {
    pub offset: usize,
    pub label: Label,
    pub kind: FixupKind,
}

/// Emitted machine code.
#[derive(Debug, Default, Clone)]
pub struct CodeBuffer {
    bytes: Vec<u8>,
    labels: Vec<Option<usize>>,
    pending: Vec<Fixup>,
    absolute: Vec<Fixup>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn emit(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    /// Pad with `fill` up to a multiple of `align`.
    pub fn align(&mut self, align: usize, fill: u8) {
        while self.bytes.len() % align != 0 {
            self.bytes.push(fill);
        }
    }

    pub fn create_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn label_offset(&self, label: Label) -> Option<usize> {
        self.labels.get(label.0).copied().flatten()
    }

    /// Bind `label` to the current offset and patch every waiting relative fixup.
    pub fn bind(&mut self, label: Label) -> CompileResult<()> {
        let slot = self
            .labels
            .get_mut(label.0)
            .ok_or_else(|| CompileError::codegen(format!("unknown label {}", label.0)))?;
        if slot.is_some() {
            return Err(CompileError::codegen(format!("label {} bound twice", label.0)));
        }
        let target = self.bytes.len();
        *slot = Some(target);

        let (ready, waiting): (Vec<Fixup>, Vec<Fixup>) =
            self.pending.drain(..).partition(|f| f.label == label);
        self.pending = waiting;
        for fixup in ready {
            self.patch_relative(fixup.offset, target)?;
        }
        log::trace!("bound label {} at {target:#x}", label.0);
        Ok(())
    }

    /// Record a rel32 at `offset` (the last 4 bytes of an instruction).
    pub fn reference_relative(&mut self, offset: usize, label: Label) -> CompileResult<()> {
        match self.label_offset(label) {
            Some(target) => self.patch_relative(offset, target),
            None => {
                self.pending.push(Fixup {
                    offset,
                    label,
                    kind: FixupKind::Relative,
                });
                Ok(())
            }
        }
    }

    /// Record an 8-byte absolute address of `label` at `offset`.
    pub fn reference_absolute(&mut self, offset: usize, label: Label) {
        self.absolute.push(Fixup {
            offset,
            label,
            kind: FixupKind::Absolute,
        });
    }

    fn patch_relative(&mut self, offset: usize, target: usize) -> CompileResult<()> {
        let next = offset + 4;
        let rel = i32::try_from(target as i64 - next as i64)
            .map_err(|_| CompileError::overflow("branch distance exceeds rel32"))?;
        self.bytes[offset..next].copy_from_slice(&rel.to_le_bytes());
        Ok(())
    }

    /// Absolute fixups with their target offsets, every label bound.
    pub fn relocations(&self) -> CompileResult<Vec<(usize, usize)>> {
        if let Some(fixup) = self.pending.first() {
            return Err(CompileError::codegen(format!(
                "label {} referenced but never bound",
                fixup.label.0
            )));
        }
        self.absolute
            .iter()
            .map(|f| {
                self.label_offset(f.label)
                    .map(|target| (f.offset, target))
                    .ok_or_else(|| {
                        CompileError::codegen(format!("label {} never bound", f.label.0))
                    })
            })
            .collect()
    }

    /// Code bytes with absolute fixups resolved for a load address of `base`.
    pub fn link(&self, base: u64) -> CompileResult<Vec<u8>> {
        let mut bytes = self.bytes.clone();
        for (offset, target) in self.relocations()? {
            let address = base + target as u64;
            bytes[offset..offset + 8].copy_from_slice(&address.to_le_bytes());
        }
        Ok(bytes)
    }
}
