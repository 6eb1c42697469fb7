// This module provides arena-based compilation session management using the bumpalo crate.
// CompilationSession owns a reference to the Bump arena that backs per-compilation scratch
// data (allocator worklists, schedule arrays, the finished code bytes) together with the
// statistics counters and the list of soundness warnings raised while planning and emitting
// a definition. Warnings are logged through the log facade as they are recorded so that the
// diagnostic stream shows every questionable decision, and are also kept for callers and
// tests to inspect. SessionStats counts folds, rewrites, CSE hits, allocated nodes,
// registers, emitted instructions and code size, and renders a summary through Display.

//! Arena-based compilation session management.

use bumpalo::Bump;
use hashbrown::HashMap;
use std::cell::RefCell;
use std::fmt;

use crate::core::error::SoundnessWarning;

/// Arena-based compilation session.
///
/// All scratch data of one compilation lives in the arena and shares the
/// session lifetime.
pub struct CompilationSession<'arena> {
    arena: &'arena Bump,
    stats: RefCell<SessionStats>,
    warnings: RefCell<Vec<SoundnessWarning>>,
}

impl<'arena> CompilationSession<'arena> {
    /// Create a new compilation session with the given arena.
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(SessionStats::default()),
            warnings: RefCell::new(Vec::new()),
        }
    }

    /// Get access to the arena allocator.
    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// Allocate a slice in the session arena.
    pub fn alloc_slice<T>(&self, slice: &[T]) -> &'arena [T]
    where
        T: Copy,
    {
        self.arena.alloc_slice_copy(slice)
    }

    /// Record a non-fatal soundness warning and log it.
    pub fn warn(&self, warning: SoundnessWarning) {
        log::warn!("{warning}");
        self.warnings.borrow_mut().push(warning);
    }

    /// Warnings recorded so far.
    pub fn warnings(&self) -> Vec<SoundnessWarning> {
        self.warnings.borrow().clone()
    }

    /// Record that a definition was compiled into `code_size` bytes.
    pub fn record_definition_compiled(&self, code_size: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.definitions_compiled += 1;
        stats.total_code_size += code_size;
    }

    /// Record one emitted machine instruction.
    pub fn record_instruction(&self, mnemonic: &'static str) {
        let mut stats = self.stats.borrow_mut();
        stats.instructions_emitted += 1;
        *stats.instruction_counts.entry(mnemonic).or_insert(0) += 1;
    }

    /// Record how many distinct registers the allocator handed out.
    pub fn record_registers_used(&self, count: usize) {
        self.stats.borrow_mut().registers_used += count;
    }

    /// Fold IR builder counters into the session.
    pub fn record_builder_stats(&self, folds: usize, rewrites: usize, cse_hits: usize, nodes: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.constants_folded = folds;
        stats.rewrites_applied = rewrites;
        stats.cse_hits = cse_hits;
        stats.nodes_created = nodes;
    }

    /// Get compilation statistics.
    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Compilation session statistics.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    /// Number of output definitions compiled.
    pub definitions_compiled: usize,

    /// Total code size generated (bytes).
    pub total_code_size: usize,

    /// Machine instructions emitted.
    pub instructions_emitted: usize,

    /// Count of each mnemonic emitted.
    pub instruction_counts: HashMap<&'static str, usize>,

    pub constants_folded: usize,
    pub rewrites_applied: usize,
    pub cse_hits: usize,
    pub nodes_created: usize,

    /// Registers handed out by the allocator.
    pub registers_used: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compilation Session Statistics:")?;
        writeln!(f, "  Definitions compiled: {}", self.definitions_compiled)?;
        writeln!(f, "  IR nodes created: {}", self.nodes_created)?;
        writeln!(f, "  Constants folded: {}", self.constants_folded)?;
        writeln!(f, "  Rewrites applied: {}", self.rewrites_applied)?;
        writeln!(f, "  CSE hits: {}", self.cse_hits)?;
        writeln!(f, "  Registers used: {}", self.registers_used)?;
        writeln!(f, "  Instructions emitted: {}", self.instructions_emitted)?;
        writeln!(f, "  Total code size: {} bytes", self.total_code_size)?;

        if !self.instruction_counts.is_empty() {
            writeln!(f, "  Instruction breakdown:")?;
            let mut sorted: Vec<_> = self.instruction_counts.iter().collect();
            sorted.sort_by_key(|(name, count)| (std::cmp::Reverse(**count), **name));

            for (mnemonic, count) in sorted.into_iter().take(10) {
                writeln!(f, "    {}: {}", mnemonic, count)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compilation_session_creation() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        let stats = session.stats();
        assert_eq!(stats.definitions_compiled, 0);
        assert_eq!(stats.instructions_emitted, 0);
        assert!(session.warnings().is_empty());
    }

    #[test]
    fn test_arena_allocation() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        let slice = session.alloc_slice(&[1, 2, 3, 4]);
        assert_eq!(slice, &[1, 2, 3, 4]);
    }

    #[test]
    fn test_warnings_are_collected() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        session.warn(SoundnessWarning::UnrollNotParallel {
            var: "y".to_string(),
        });
        assert_eq!(session.warnings().len(), 1);
    }

    #[test]
    fn test_session_statistics() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        session.record_definition_compiled(128);
        session.record_instruction("add");
        session.record_instruction("movaps");
        session.record_instruction("add");
        session.record_registers_used(3);

        let stats = session.stats();
        assert_eq!(stats.definitions_compiled, 1);
        assert_eq!(stats.instructions_emitted, 3);
        assert_eq!(stats.total_code_size, 128);
        assert_eq!(stats.instruction_counts["add"], 2);
        assert_eq!(stats.registers_used, 3);
        assert!(stats.to_string().contains("add: 2"));
    }
}
