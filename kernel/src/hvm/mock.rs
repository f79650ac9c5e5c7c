//! A scripted vendor backend for exercising the run loop without
//! virtualization hardware.

extern crate alloc;

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use super::{
    CacheType, ExitInfo, ExitReason, GuestEvent, GuestInstr, GuestReg, GuestSeg, GuestSegDesc,
    VendorVm, GUEST_FL_IF,
};
use crate::error::HvmError;

#[derive(Default)]
pub struct MockState {
    pub regs: BTreeMap<u8, u32>,
    pub segs: BTreeMap<u8, GuestSegDesc>,
    /// Exits the scripted guest produces, in order. An exhausted
    /// script shuts the VM down.
    pub script: VecDeque<(ExitReason, ExitInfo)>,
    pub injected: Vec<(GuestEvent, u8)>,
    pub pending: bool,
    pub shadow: bool,
    pub intr_enabled: bool,
    pub intr_window_armed: bool,
    pub next_eip: u32,
    pub runs: usize,
    pub mappings: BTreeMap<u32, u32>,
    pub port_intercepts: BTreeMap<u16, bool>,
}

fn reg_key(reg: GuestReg) -> u8 {
    match reg {
        GuestReg::Eax => 0,
        GuestReg::Ebx => 1,
        GuestReg::Ecx => 2,
        GuestReg::Edx => 3,
        GuestReg::Esi => 4,
        GuestReg::Edi => 5,
        GuestReg::Ebp => 6,
        GuestReg::Esp => 7,
        GuestReg::Eip => 8,
        GuestReg::Eflags => 9,
        GuestReg::Cr0 => 10,
        GuestReg::Cr2 => 11,
        GuestReg::Cr3 => 12,
        GuestReg::Cr4 => 13,
    }
}

fn seg_key(seg: GuestSeg) -> u8 {
    match seg {
        GuestSeg::Cs => 0,
        GuestSeg::Ds => 1,
        GuestSeg::Es => 2,
        GuestSeg::Fs => 3,
        GuestSeg::Gs => 4,
        GuestSeg::Ss => 5,
        GuestSeg::Ldtr => 6,
        GuestSeg::Tr => 7,
        GuestSeg::Gdtr => 8,
        GuestSeg::Idtr => 9,
    }
}

/// Serializes tests that occupy the process-wide VM pool.
pub static POOL_GATE: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Take the pool gate, shrugging off poisoning from a failed test.
pub fn pool_gate() -> std::sync::MutexGuard<'static, ()> {
    POOL_GATE.lock().unwrap_or_else(|e| e.into_inner())
}

/// Handle shared between the test and the boxed backend.
#[derive(Clone)]
pub struct MockVm(pub Arc<Mutex<MockState>>);

impl MockVm {
    pub fn new(script: Vec<(ExitReason, ExitInfo)>, intr_enabled: bool) -> Self {
        let state = MockState {
            script: script.into(),
            intr_enabled,
            next_eip: 0x7C02,
            ..MockState::default()
        };
        MockVm(Arc::new(Mutex::new(state)))
    }
}

impl VendorVm for MockVm {
    fn run(&mut self) -> Result<(ExitReason, ExitInfo), HvmError> {
        let mut st = self.0.lock();
        st.runs += 1;
        match st.script.pop_front() {
            Some(step) => Ok(step),
            None => Ok((ExitReason::Shutdown, ExitInfo::None)),
        }
    }

    fn set_reg(&mut self, reg: GuestReg, val: u32) -> Result<(), HvmError> {
        self.0.lock().regs.insert(reg_key(reg), val);
        Ok(())
    }

    fn get_reg(&self, reg: GuestReg) -> Result<u32, HvmError> {
        Ok(self.0.lock().regs.get(&reg_key(reg)).copied().unwrap_or(0))
    }

    fn set_desc(&mut self, seg: GuestSeg, desc: &GuestSegDesc) -> Result<(), HvmError> {
        self.0.lock().segs.insert(seg_key(seg), *desc);
        Ok(())
    }

    fn get_desc(&self, seg: GuestSeg) -> Result<GuestSegDesc, HvmError> {
        Ok(self
            .0
            .lock()
            .segs
            .get(&seg_key(seg))
            .copied()
            .unwrap_or_default())
    }

    fn get_next_eip(&self, _instr: GuestInstr) -> Result<u32, HvmError> {
        Ok(self.0.lock().next_eip)
    }

    fn inject_event(
        &mut self,
        ev: GuestEvent,
        vector: u8,
        _errcode: u32,
        _deliver_errcode: bool,
    ) -> Result<(), HvmError> {
        let mut st = self.0.lock();
        st.injected.push((ev, vector));
        st.pending = true;
        Ok(())
    }

    fn pending_event(&self) -> bool {
        self.0.lock().pending
    }

    fn intr_shadow(&self) -> bool {
        self.0.lock().shadow
    }

    fn guest_intr_enabled(&self) -> bool {
        let st = self.0.lock();
        st.intr_enabled || st.regs.get(&reg_key(GuestReg::Eflags)).copied().unwrap_or(0) & GUEST_FL_IF != 0
    }

    fn intercept_ioport(&mut self, port: u16, enable: bool) {
        self.0.lock().port_intercepts.insert(port, enable);
    }

    fn intercept_msr(&mut self, _msr: u32, _enable: bool) {}

    fn intercept_intr_window(&mut self, enable: bool) {
        self.0.lock().intr_window_armed = enable;
    }

    fn set_mmap(&mut self, gpa: u32, hpa: u32, _ctype: CacheType) -> Result<(), HvmError> {
        self.0.lock().mappings.insert(gpa, hpa);
        Ok(())
    }

    fn translate_gpa(&self, gpa: u32) -> Option<u32> {
        let st = self.0.lock();
        st.mappings
            .get(&crate::mm::page_down(gpa))
            .map(|hpa| hpa | crate::mm::page_off(gpa))
    }

    fn set_tsc_offset(&mut self, _offset: u64) {}
}
