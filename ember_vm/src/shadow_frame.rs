//! Interpreter frames.
//!
//! A [`ShadowFrame`] holds one method activation: its virtual registers,
//! the dex pc, the monitors it entered, and bookkeeping for
//! instrumentation and deoptimization.
//!
//! # Reference shadow
//!
//! Every vreg has a 32-bit value and a parallel reference slot. Writing a
//! primitive clears the reference slot, so the collector only ever sees
//! registers that currently hold references. The raw value of a reference
//! register mirrors `ObjRef::raw` and is kept in sync when the collector
//! rewrites the slot.

use crate::mirror::Method;
use crate::value::JValue;
use bitflags::bitflags;
use ember_core::{ObjRef, ThreadId};
use ember_gc::{RootInfo, RootKind, RootVisitor};
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

bitflags! {
    /// Per-frame control bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FrameFlags: u32 {
        /// Pop the frame without running the rest of the method.
        const FORCE_POP = 1 << 0;
        /// Re-execute the current invoke when the callee returns.
        const FORCE_RETRY = 1 << 1;
        /// Report every dex-pc move to instrumentation.
        const NOTIFY_DEX_PC_MOVE = 1 << 2;
        /// An exception was just caught in this frame and not yet reported.
        const NOTIFY_EXCEPTION_HANDLED = 1 << 3;
        /// The method-exit event already fired for this frame.
        const SKIP_METHOD_EXIT = 1 << 4;
        /// The pending exception was raised by a listener; do not report it
        /// to exception-thrown listeners again.
        const SKIP_NEXT_EXCEPTION = 1 << 5;
        /// Frame was reconstructed by the deoptimizer.
        const DEOPTIMIZED = 1 << 6;
    }
}

/// An interpreter activation record.
pub struct ShadowFrame {
    method: Arc<Method>,
    /// Index of the caller in the managed stack.
    link: Option<usize>,
    dex_pc: u32,
    vregs: Box<[u32]>,
    refs: Box<[Option<ObjRef>]>,
    flags: FrameFlags,
    /// Monitors entered by `monitor-enter` and not yet exited, innermost last.
    held_monitors: SmallVec<[ObjRef; 2]>,
    /// Value of the last invoke or `filled-new-array`.
    pub result_register: JValue,
    /// Back-edges left before the next hotness report.
    pub cached_hotness_countdown: i32,
    /// Exception delivered to a catch handler, read by `move-exception`.
    pub caught_exception: Option<ObjRef>,
}

impl ShadowFrame {
    pub fn create(num_vregs: usize, link: Option<usize>, method: Arc<Method>, dex_pc: u32) -> Self {
        Self {
            method,
            link,
            dex_pc,
            vregs: vec![0; num_vregs].into_boxed_slice(),
            refs: vec![None; num_vregs].into_boxed_slice(),
            flags: FrameFlags::empty(),
            held_monitors: SmallVec::new(),
            result_register: JValue::VOID,
            cached_hotness_countdown: 0,
            caught_exception: None,
        }
    }

    #[inline]
    pub fn method(&self) -> &Arc<Method> {
        &self.method
    }

    #[inline]
    pub fn link(&self) -> Option<usize> {
        self.link
    }

    #[inline]
    pub(crate) fn set_link(&mut self, link: Option<usize>) {
        self.link = link;
    }

    #[inline]
    pub fn dex_pc(&self) -> u32 {
        self.dex_pc
    }

    #[inline]
    pub fn set_dex_pc(&mut self, dex_pc: u32) {
        self.dex_pc = dex_pc;
    }

    #[inline]
    pub fn num_vregs(&self) -> usize {
        self.vregs.len()
    }

    // =========================================================================
    // Vregs
    // =========================================================================

    #[inline]
    pub fn get_vreg(&self, i: usize) -> i32 {
        self.vregs[i] as i32
    }

    #[inline]
    pub fn set_vreg(&mut self, i: usize, value: i32) {
        self.vregs[i] = value as u32;
        self.refs[i] = None;
    }

    #[inline]
    pub fn get_vreg_float(&self, i: usize) -> f32 {
        f32::from_bits(self.vregs[i])
    }

    #[inline]
    pub fn set_vreg_float(&mut self, i: usize, value: f32) {
        self.vregs[i] = value.to_bits();
        self.refs[i] = None;
    }

    /// Wide values occupy `i` (low half) and `i + 1` (high half).
    #[inline]
    pub fn get_vreg_long(&self, i: usize) -> i64 {
        (u64::from(self.vregs[i]) | (u64::from(self.vregs[i + 1]) << 32)) as i64
    }

    #[inline]
    pub fn set_vreg_long(&mut self, i: usize, value: i64) {
        let bits = value as u64;
        self.vregs[i] = bits as u32;
        self.vregs[i + 1] = (bits >> 32) as u32;
        self.refs[i] = None;
        self.refs[i + 1] = None;
    }

    #[inline]
    pub fn get_vreg_double(&self, i: usize) -> f64 {
        f64::from_bits(self.get_vreg_long(i) as u64)
    }

    #[inline]
    pub fn set_vreg_double(&mut self, i: usize, value: f64) {
        self.set_vreg_long(i, value.to_bits() as i64);
    }

    #[inline]
    pub fn get_vreg_reference(&self, i: usize) -> Option<ObjRef> {
        self.refs[i]
    }

    #[inline]
    pub fn set_vreg_reference(&mut self, i: usize, value: Option<ObjRef>) {
        self.vregs[i] = value.map_or(0, ObjRef::raw);
        self.refs[i] = value;
    }

    /// Copy a register verbatim, reference shadow included.
    #[inline]
    pub fn copy_vreg(&mut self, dst: usize, src: usize) {
        self.vregs[dst] = self.vregs[src];
        self.refs[dst] = self.refs[src];
    }

    /// Store `value` into `i` using the representation `shorty` names.
    pub fn set_vreg_value(&mut self, i: usize, shorty: char, value: JValue) {
        match shorty {
            'J' | 'D' => self.set_vreg_long(i, value.long()),
            'L' | '[' => self.set_vreg_reference(i, value.reference()),
            _ => self.set_vreg(i, value.int()),
        }
    }

    // =========================================================================
    // Flags
    // =========================================================================

    #[inline]
    pub fn flags(&self) -> FrameFlags {
        self.flags
    }

    #[inline]
    pub fn has_flag(&self, flag: FrameFlags) -> bool {
        self.flags.contains(flag)
    }

    #[inline]
    pub fn set_flag(&mut self, flag: FrameFlags) {
        self.flags.insert(flag);
    }

    #[inline]
    pub fn clear_flag(&mut self, flag: FrameFlags) {
        self.flags.remove(flag);
    }

    // =========================================================================
    // Lock-count data
    // =========================================================================

    pub fn add_monitor(&mut self, obj: ObjRef) {
        self.held_monitors.push(obj);
    }

    /// Forget the innermost entry of `obj`. Returns `false` if the frame
    /// does not hold it.
    pub fn remove_monitor(&mut self, obj: ObjRef) -> bool {
        match self.held_monitors.iter().rposition(|&m| m == obj) {
            Some(pos) => {
                self.held_monitors.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn held_monitors(&self) -> &[ObjRef] {
        &self.held_monitors
    }

    pub fn take_held_monitors(&mut self) -> SmallVec<[ObjRef; 2]> {
        std::mem::take(&mut self.held_monitors)
    }

    // =========================================================================
    // Roots
    // =========================================================================

    pub fn visit_roots(&mut self, visitor: &mut dyn RootVisitor, thread: ThreadId) {
        let frame_info = RootInfo::thread(RootKind::ShadowFrame, thread);
        for (slot, raw) in self.refs.iter_mut().zip(self.vregs.iter_mut()) {
            if slot.is_some() {
                visitor.visit_root(slot, frame_info);
                *raw = slot.map_or(0, ObjRef::raw);
            }
        }
        let result = self.result_register.reference_mut();
        if result.is_some() {
            visitor.visit_root(result, frame_info);
        }
        visitor.visit_root(&mut self.caught_exception, frame_info);
        let monitor_info = RootInfo::thread(RootKind::Monitor, thread);
        for monitor in self.held_monitors.iter_mut() {
            let mut slot = Some(*monitor);
            visitor.visit_root(&mut slot, monitor_info);
            if let Some(moved) = slot {
                *monitor = moved;
            }
        }
    }
}

impl fmt::Debug for ShadowFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShadowFrame")
            .field("method", &self.method.name)
            .field("dex_pc", &self.dex_pc)
            .field("vregs", &self.vregs)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::DexFile;
    use crate::mirror::AccessFlags;
    use ember_core::{ClassId, MethodId};

    fn frame(vregs: usize) -> ShadowFrame {
        let method = Arc::new(Method::new(
            MethodId(0),
            ClassId(0),
            "run".to_string(),
            "V".to_string(),
            AccessFlags::STATIC,
            None,
            None,
            Arc::new(DexFile::new("frame-test.dex")),
            None,
        ));
        ShadowFrame::create(vregs, None, method, 0)
    }

    #[test]
    fn test_primitive_write_clears_reference() {
        let mut f = frame(2);
        let obj = ObjRef::from_index(9);
        f.set_vreg_reference(0, Some(obj));
        assert_eq!(f.get_vreg_reference(0), Some(obj));
        assert_eq!(f.get_vreg(0) as u32, obj.raw());
        f.set_vreg(0, 5);
        assert_eq!(f.get_vreg_reference(0), None);
        assert_eq!(f.get_vreg(0), 5);
    }

    #[test]
    fn test_wide_registers() {
        let mut f = frame(3);
        f.set_vreg_reference(2, Some(ObjRef::from_index(1)));
        f.set_vreg_long(1, -0x1234_5678_9abc);
        assert_eq!(f.get_vreg_long(1), -0x1234_5678_9abc);
        assert_eq!(f.get_vreg_reference(2), None);
        f.set_vreg_double(0, 2.5);
        assert_eq!(f.get_vreg_double(0), 2.5);
    }

    #[test]
    fn test_monitor_bookkeeping() {
        let mut f = frame(1);
        let a = ObjRef::from_index(1);
        let b = ObjRef::from_index(2);
        f.add_monitor(a);
        f.add_monitor(b);
        f.add_monitor(a);
        assert!(f.remove_monitor(a));
        assert_eq!(f.held_monitors(), &[a, b]);
        assert!(!f.remove_monitor(ObjRef::from_index(3)));
        assert_eq!(f.take_held_monitors().len(), 2);
        assert!(f.held_monitors().is_empty());
    }

    #[test]
    fn test_visit_roots_updates_raw_value() {
        let mut f = frame(2);
        let old = ObjRef::from_index(4);
        let new = ObjRef::from_index(40);
        f.set_vreg_reference(1, Some(old));
        f.set_vreg(0, 77);
        let mut seen = 0;
        f.visit_roots(
            &mut |slot: &mut Option<ObjRef>, info: RootInfo| {
                if info.kind == RootKind::ShadowFrame && *slot == Some(old) {
                    seen += 1;
                    *slot = Some(new);
                }
            },
            ThreadId(1),
        );
        assert_eq!(seen, 1);
        assert_eq!(f.get_vreg_reference(1), Some(new));
        assert_eq!(f.get_vreg(1) as u32, new.raw());
        assert_eq!(f.get_vreg(0), 77);
    }
}
