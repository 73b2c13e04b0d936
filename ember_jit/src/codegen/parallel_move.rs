//! Parallel move resolution.
//!
//! A parallel move assigns several locations at once: every source is read
//! before any destination is written. The resolver orders the moves so no
//! source is clobbered before it is read and breaks cycles with swaps.

use super::hir::{DataType, MoveOperands};
use super::location::Location;

/// Sink for the moves and swaps the resolver decides on.
pub trait MoveEmitter {
    fn emit_move(&mut self, destination: Location, source: Location, ty: DataType);
    fn emit_swap(&mut self, a: Location, b: Location, ty: DataType);
}

#[derive(Debug, Clone, Copy)]
struct PendingMove {
    source: Location,
    destination: Location,
    ty: DataType,
}

impl PendingMove {
    #[inline]
    fn is_eliminated(&self) -> bool {
        !self.source.is_valid()
    }

    /// Destination cleared while the move's blockers are being performed.
    #[inline]
    fn is_pending(&self) -> bool {
        !self.is_eliminated() && !self.destination.is_valid()
    }

    #[inline]
    fn blocks(&self, loc: &Location) -> bool {
        !self.is_eliminated() && self.source.overlaps(loc)
    }
}

/// Emit `moves` as if performed simultaneously.
pub fn resolve(moves: &[MoveOperands], emitter: &mut impl MoveEmitter) {
    let mut pending: Vec<PendingMove> = moves
        .iter()
        .filter(|m| m.destination.is_valid() && m.source != m.destination)
        .map(|m| PendingMove {
            source: m.source,
            destination: m.destination,
            ty: m.ty,
        })
        .collect();

    // Constants read nothing; they go last so they cannot be clobbered
    // and never block.
    for i in 0..pending.len() {
        if !pending[i].is_eliminated() && !pending[i].source.is_constant() {
            perform_move(&mut pending, i, emitter);
        }
    }
    for m in pending.iter_mut().filter(|m| !m.is_eliminated()) {
        emitter.emit_move(m.destination, m.source, m.ty);
        m.source = Location::Invalid;
    }
}

fn perform_move(moves: &mut [PendingMove], index: usize, emitter: &mut impl MoveEmitter) {
    let destination = moves[index].destination;
    moves[index].destination = Location::Invalid;

    for i in 0..moves.len() {
        if moves[i].blocks(&destination) && !moves[i].is_pending() && !moves[i].source.is_constant() {
            perform_move(moves, i, emitter);
        }
    }
    moves[index].destination = destination;

    let source = moves[index].source;
    if source.overlaps(&destination) {
        // A swap further down the chain already put the value in place.
        moves[index].source = Location::Invalid;
        return;
    }

    let blocked = (0..moves.len()).any(|i| i != index && moves[i].blocks(&destination));
    if blocked {
        emitter.emit_swap(source, destination, moves[index].ty);
        moves[index].source = Location::Invalid;
        for m in moves.iter_mut() {
            if m.blocks(&source) {
                m.source = destination;
            } else if m.blocks(&destination) {
                m.source = source;
            }
        }
    } else {
        emitter.emit_move(destination, source, moves[index].ty);
        moves[index].source = Location::Invalid;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::x64::CpuRegister::{self, *};
    use rustc_hash::FxHashMap;

    /// Simulates registers holding symbolic values.
    #[derive(Default)]
    struct Machine {
        state: FxHashMap<CpuRegister, i64>,
        ops: usize,
        swaps: usize,
    }

    impl Machine {
        fn read(&self, loc: Location) -> i64 {
            match loc {
                Location::Register(r) => self.state[&r],
                Location::Constant(v) => v,
                other => panic!("unexpected {other}"),
            }
        }
    }

    impl MoveEmitter for Machine {
        fn emit_move(&mut self, destination: Location, source: Location, _: DataType) {
            let v = self.read(source);
            self.state.insert(destination.reg(), v);
            self.ops += 1;
        }

        fn emit_swap(&mut self, a: Location, b: Location, _: DataType) {
            let (va, vb) = (self.read(a), self.read(b));
            self.state.insert(a.reg(), vb);
            self.state.insert(b.reg(), va);
            self.ops += 1;
            self.swaps += 1;
        }
    }

    fn mv(dst: Location, src: Location) -> MoveOperands {
        MoveOperands {
            source: src,
            destination: dst,
            ty: DataType::Int32,
        }
    }

    fn r(reg: CpuRegister) -> Location {
        Location::Register(reg)
    }

    fn machine() -> Machine {
        let mut m = Machine::default();
        for (i, reg) in [RAX, RCX, RDX, RBX, RSI, RDI].into_iter().enumerate() {
            m.state.insert(reg, i as i64 * 10);
        }
        m
    }

    #[test]
    fn test_chain_is_ordered() {
        let mut m = machine();
        // rcx <- rax, rdx <- rcx: rdx must read rcx first.
        resolve(&[mv(r(RCX), r(RAX)), mv(r(RDX), r(RCX))], &mut m);
        assert_eq!(m.state[&RCX], 0);
        assert_eq!(m.state[&RDX], 10);
        assert_eq!(m.swaps, 0);
    }

    #[test]
    fn test_two_cycle_swaps() {
        let mut m = machine();
        resolve(&[mv(r(RAX), r(RCX)), mv(r(RCX), r(RAX))], &mut m);
        assert_eq!(m.state[&RAX], 10);
        assert_eq!(m.state[&RCX], 0);
        assert_eq!(m.ops, 1);
    }

    #[test]
    fn test_three_cycle() {
        let mut m = machine();
        resolve(
            &[mv(r(RAX), r(RCX)), mv(r(RCX), r(RDX)), mv(r(RDX), r(RAX))],
            &mut m,
        );
        assert_eq!(m.state[&RAX], 10);
        assert_eq!(m.state[&RCX], 20);
        assert_eq!(m.state[&RDX], 0);
        assert_eq!(m.swaps, 2);
    }

    #[test]
    fn test_fan_out_and_constants() {
        let mut m = machine();
        resolve(
            &[
                mv(r(RCX), r(RAX)),
                mv(r(RAX), Location::Constant(7)),
                mv(r(RDX), r(RAX)),
                mv(r(RBX), r(RBX)),
            ],
            &mut m,
        );
        assert_eq!(m.state[&RCX], 0);
        assert_eq!(m.state[&RDX], 0);
        assert_eq!(m.state[&RAX], 7);
        assert_eq!(m.ops, 3);
    }

    #[test]
    fn test_cycle_with_tail() {
        let mut m = machine();
        // rax <-> rcx plus rsi <- rax.
        resolve(
            &[mv(r(RAX), r(RCX)), mv(r(RCX), r(RAX)), mv(r(RSI), r(RAX))],
            &mut m,
        );
        assert_eq!(m.state[&RAX], 10);
        assert_eq!(m.state[&RCX], 0);
        assert_eq!(m.state[&RSI], 0);
    }
}
