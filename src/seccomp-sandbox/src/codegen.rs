// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The instruction DAG behind the filter compiler.
//!
//! Pseudo-instructions live in an arena and reference each other by index
//! handle, never by pointer. Nodes are immutable once created, except for the
//! one concession to the builder: a load's fall-through successor may be
//! joined in after creation. Common suffixes (typically the final "deny"
//! return) are shared rather than duplicated, which makes this a DAG, not a
//! tree.
//!
//! Flattening emits the program back-to-front with memoization, so every
//! shared node is materialized once and every jump is a forward jump, as
//! classic BPF requires. Conditional jump offsets are a single byte; when a
//! target is further away than 255 instructions, an unconditional `BPF_JA`
//! trampoline is inserted to bridge the distance.

use crate::common::{
    sock_filter, BpfProgram, BPF_ABS, BPF_JA, BPF_JMP, BPF_JUMP, BPF_K, BPF_LD, BPF_MAX_LEN,
    BPF_RET, BPF_STMT, BPF_W,
};

/// Code generation errors.
#[derive(Debug, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum CodegenError {
    /// A load instruction was flattened without a joined successor.
    DanglingLoad,
    /// Attempted to join a successor to a non-load or already-joined node.
    BadJoin,
    /// The compiled filter exceeds the kernel limit of {BPF_MAX_LEN:?} instructions.
    ProgramTooLarge,
}

/// Handle to an instruction node inside a `CodeGen` arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct NodeRef(usize);

#[derive(Clone, Copy, Debug)]
enum Node {
    /// Load a 32-bit field at `offset` of `struct seccomp_data` into the
    /// accumulator, then fall through to `next`.
    Load { offset: u32, next: Option<NodeRef> },
    /// Conditional jump comparing the accumulator against `k`.
    Jump {
        op: u16,
        k: u32,
        jt: NodeRef,
        jf: NodeRef,
    },
    /// Terminate the filter with the encoded value `k`.
    Ret { k: u32 },
}

/// Arena-backed builder for the filter instruction DAG.
#[derive(Debug, Default)]
pub(crate) struct CodeGen {
    nodes: Vec<Node>,
}

impl CodeGen {
    pub(crate) fn new() -> CodeGen {
        CodeGen::default()
    }

    fn push(&mut self, node: Node) -> NodeRef {
        self.nodes.push(node);
        NodeRef(self.nodes.len() - 1)
    }

    /// Creates a field load, optionally pre-joined to its successor.
    pub(crate) fn make_load(&mut self, offset: u32, next: Option<NodeRef>) -> NodeRef {
        self.push(Node::Load { offset, next })
    }

    /// Creates a conditional jump. `op` is one of the `BPF_J*` comparison
    /// codes; `jt`/`jf` are taken when the comparison is true/false.
    pub(crate) fn make_jump(&mut self, op: u16, k: u32, jt: NodeRef, jf: NodeRef) -> NodeRef {
        self.push(Node::Jump { op, k, jt, jf })
    }

    /// Creates a return of the encoded value `k`.
    pub(crate) fn make_ret(&mut self, k: u32) -> NodeRef {
        self.push(Node::Ret { k })
    }

    /// Threads `next` as the fall-through successor of the load `tail`.
    pub(crate) fn join(&mut self, tail: NodeRef, next: NodeRef) -> Result<(), CodegenError> {
        match self.nodes[tail.0] {
            Node::Load {
                next: ref mut slot @ None,
                ..
            } => {
                *slot = Some(next);
                Ok(())
            }
            _ => Err(CodegenError::BadJoin),
        }
    }

    /// Flattens the DAG rooted at `head` into a linear BPF program.
    pub(crate) fn compile(&self, head: NodeRef) -> Result<BpfProgram, CodegenError> {
        // `out` holds the program in reverse; an instruction at reversed
        // index `q` lands at final index `len - 1 - q`, so a forward jump
        // from reversed `s` to reversed `t` has offset `s - t - 1`.
        let mut out: Vec<sock_filter> = Vec::new();
        let mut memo: Vec<Option<usize>> = vec![None; self.nodes.len()];
        self.emit(head, &mut out, &mut memo)?;
        if out.len() > BPF_MAX_LEN {
            return Err(CodegenError::ProgramTooLarge);
        }
        out.reverse();
        Ok(out)
    }

    /// Emits `node` (and, first, everything it can reach) into the reversed
    /// program, returning its reversed index. Shared nodes are emitted once.
    fn emit(
        &self,
        node: NodeRef,
        out: &mut Vec<sock_filter>,
        memo: &mut Vec<Option<usize>>,
    ) -> Result<usize, CodegenError> {
        if let Some(pos) = memo[node.0] {
            return Ok(pos);
        }
        let pos = match self.nodes[node.0] {
            Node::Ret { k } => {
                out.push(BPF_STMT(BPF_RET + BPF_K, k));
                out.len() - 1
            }
            Node::Load { offset, next } => {
                let next = next.ok_or(CodegenError::DanglingLoad)?;
                let t = self.emit(next, out, memo)?;
                // A load continues at the physically adjacent instruction;
                // if the successor was emitted elsewhere, bridge with a JA.
                if t + 1 != out.len() {
                    #[allow(clippy::cast_possible_truncation)]
                    out.push(BPF_STMT(BPF_JMP + BPF_JA, (out.len() - t - 1) as u32));
                }
                out.push(BPF_STMT(BPF_LD + BPF_W + BPF_ABS, offset));
                out.len() - 1
            }
            Node::Jump { op, k, jt, jf } => {
                let mut jt_q = self.emit(jt, out, memo)?;
                let mut jf_q = self.emit(jf, out, memo)?;
                // Conditional offsets are a u8; plant trampolines for far
                // targets. The margin accounts for the other trampoline
                // possibly landing in between.
                for q in [&mut jt_q, &mut jf_q] {
                    if out.len() - *q > usize::from(u8::MAX) {
                        #[allow(clippy::cast_possible_truncation)]
                        out.push(BPF_STMT(BPF_JMP + BPF_JA, (out.len() - *q - 1) as u32));
                        *q = out.len() - 1;
                    }
                }
                let s = out.len();
                #[allow(clippy::cast_possible_truncation)]
                out.push(BPF_JUMP(
                    BPF_JMP + op + BPF_K,
                    k,
                    (s - jt_q - 1) as u8,
                    (s - jf_q - 1) as u8,
                ));
                s
            }
        };
        memo[node.0] = Some(pos);
        Ok(pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{BPF_JEQ, BPF_JGE, SECCOMP_RET_ALLOW, SECCOMP_RET_TRAP};

    #[test]
    fn test_single_return() {
        let mut gen = CodeGen::new();
        let ret = gen.make_ret(SECCOMP_RET_ALLOW);
        let program = gen.compile(ret).unwrap();
        assert_eq!(program, vec![BPF_STMT(BPF_RET + BPF_K, SECCOMP_RET_ALLOW)]);
    }

    #[test]
    fn test_load_falls_through() {
        let mut gen = CodeGen::new();
        let ret = gen.make_ret(SECCOMP_RET_ALLOW);
        let load = gen.make_load(0, None);
        gen.join(load, ret).unwrap();
        let program = gen.compile(load).unwrap();
        assert_eq!(
            program,
            vec![
                BPF_STMT(BPF_LD + BPF_W + BPF_ABS, 0),
                BPF_STMT(BPF_RET + BPF_K, SECCOMP_RET_ALLOW),
            ]
        );
    }

    #[test]
    fn test_dangling_load_is_rejected() {
        let mut gen = CodeGen::new();
        let load = gen.make_load(0, None);
        assert_eq!(gen.compile(load), Err(CodegenError::DanglingLoad));
    }

    #[test]
    fn test_join_twice_is_rejected() {
        let mut gen = CodeGen::new();
        let ret = gen.make_ret(0);
        let load = gen.make_load(0, Some(ret));
        assert_eq!(gen.join(load, ret), Err(CodegenError::BadJoin));
    }

    #[test]
    fn test_shared_suffix_emitted_once() {
        // Both branches return the same shared node; the flattened program
        // must contain a single copy of it.
        let mut gen = CodeGen::new();
        let shared = gen.make_ret(SECCOMP_RET_TRAP);
        let jump = gen.make_jump(BPF_JEQ, 42, shared, shared);
        let program = gen.compile(jump).unwrap();
        assert_eq!(
            program,
            vec![
                BPF_JUMP(BPF_JMP + BPF_JEQ + BPF_K, 42, 0, 0),
                BPF_STMT(BPF_RET + BPF_K, SECCOMP_RET_TRAP),
            ]
        );
    }

    #[test]
    fn test_far_jumps_get_trampolines() {
        // A deep comparison ladder whose true branch always targets one
        // shared return; the shared target ends up more than 255
        // instructions away from the top rungs.
        let mut gen = CodeGen::new();
        let shared = gen.make_ret(SECCOMP_RET_TRAP);
        let mut tail = gen.make_ret(SECCOMP_RET_ALLOW);
        for i in 0..400 {
            tail = gen.make_jump(BPF_JGE, i, shared, tail);
        }
        let program = gen.compile(tail).unwrap();

        // Every conditional jump must land inside the program.
        for (i, insn) in program.iter().enumerate() {
            if insn.code & 0x07 == BPF_JMP && insn.code != BPF_JMP + BPF_JA {
                assert!(i + 1 + usize::from(insn.jt) < program.len());
                assert!(i + 1 + usize::from(insn.jf) < program.len());
            }
        }
        // Trampolines were actually needed.
        assert!(program
            .iter()
            .any(|insn| insn.code == BPF_JMP + BPF_JA && insn.k > 0));
    }
}
