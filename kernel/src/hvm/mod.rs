//! The hardware virtual machine monitor.
//!
//! A vendor-independent facade over AMD SVM and Intel VMX. Each live VM
//! couples a vendor state block (VMCB or VMCS) behind the `VendorVm`
//! trait, a nested page table mapping guest-physical to host-physical
//! memory, the virtual-device routing tables, and a virtual PIC. The
//! run loop enters the guest, classifies the exit, dispatches it (to a
//! handler, inline emulation, or a user-mode device over a channel) and
//! re-enters, injecting any deliverable interrupt first.

pub mod nested;
pub mod svm;
pub mod vdev;
pub mod vmx;
pub mod vpic;

extern crate alloc;

use alloc::boxed::Box;

use crate::{
    arch::x86::{cpu, CpuVendor},
    config::{GUEST_PHY_MEMORY_SIZE, GUEST_TSC_FREQ, MAX_VMID},
    error::HvmError,
    mm::{page_down, PhysPool, PAGE_SIZE},
    proc::Pid,
    sync::SpinLock,
};

/// Guest I/O access width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataSz {
    Sz8 = 0,
    Sz16 = 1,
    Sz32 = 2,
}

impl DataSz {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(DataSz::Sz8),
            1 => Some(DataSz::Sz16),
            2 => Some(DataSz::Sz32),
            _ => None,
        }
    }

    pub const fn bytes(self) -> u32 {
        match self {
            DataSz::Sz8 => 1,
            DataSz::Sz16 => 2,
            DataSz::Sz32 => 4,
        }
    }

    /// Mask covering the accessed portion of a 32-bit register.
    pub const fn mask(self) -> u32 {
        match self {
            DataSz::Sz8 => 0xFF,
            DataSz::Sz16 => 0xFFFF,
            DataSz::Sz32 => 0xFFFF_FFFF,
        }
    }
}

/// Why the guest exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    None,
    /// A host interrupt arrived while the guest ran.
    ExtIntr,
    /// The guest opened an interrupt window we asked to see.
    IntrWindow,
    Ioport,
    /// Nested page fault (NPT/EPT violation).
    PageFault,
    Rdmsr,
    Wrmsr,
    Cpuid,
    Rdtsc,
    /// The guest executed hlt.
    Hlt,
    /// The guest tripped over an instruction it may not run.
    InvalInstr,
    /// Triple fault or vendor shutdown state.
    Shutdown,
    Invalid,
}

/// Details of the latest exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExitInfo {
    #[default]
    None,
    Ioport(IoportExit),
    PageFault {
        gpa: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoportExit {
    pub port: u16,
    pub width: DataSz,
    pub write: bool,
    pub rep: bool,
    pub str_op: bool,
}

/// Guest general and control registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestReg {
    Eax,
    Ebx,
    Ecx,
    Edx,
    Esi,
    Edi,
    Ebp,
    Esp,
    Eip,
    Eflags,
    Cr0,
    Cr2,
    Cr3,
    Cr4,
}

/// Guest segment and descriptor-table registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestSeg {
    Cs,
    Ds,
    Es,
    Fs,
    Gs,
    Ss,
    Ldtr,
    Tr,
    Gdtr,
    Idtr,
}

/// A guest segment descriptor in unpacked form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GuestSegDesc {
    pub sel: u16,
    pub base: u64,
    pub lim: u32,
    /// Access rights, vendor-neutral encoding (type, S, DPL, P, ...).
    pub ar: u32,
}

/// Kinds of injectable events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestEvent {
    ExtIntr,
    Nmi,
    Exception,
    SwInt,
}

/// Instructions whose emulation must advance the guest EIP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestInstr {
    In,
    Out,
    Rdmsr,
    Wrmsr,
    Cpuid,
    Rdtsc,
    Hypercall,
}

/// Memory cache attribute for nested mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheType {
    WriteBack,
    Uncacheable,
}

/// EFLAGS.IF.
pub const GUEST_FL_IF: u32 = 1 << 9;

/// The vendor half of a virtual machine: VMCB on AMD, VMCS on Intel.
///
/// Exactly one implementation instance exists per VM, owned by the VM
/// slot and only driven while the VM is stopped or by the owner CPU in
/// the run loop. `run` enters the guest and classifies the exit;
/// vendor-internal exits that never surface (HLT's EIP advance, for
/// one) are settled before it returns.
pub trait VendorVm: Send {
    fn run(&mut self) -> Result<(ExitReason, ExitInfo), HvmError>;

    fn set_reg(&mut self, reg: GuestReg, val: u32) -> Result<(), HvmError>;
    fn get_reg(&self, reg: GuestReg) -> Result<u32, HvmError>;

    fn set_desc(&mut self, seg: GuestSeg, desc: &GuestSegDesc) -> Result<(), HvmError>;
    fn get_desc(&self, seg: GuestSeg) -> Result<GuestSegDesc, HvmError>;

    /// EIP after the instruction that caused the current exit.
    fn get_next_eip(&self, instr: GuestInstr) -> Result<u32, HvmError>;

    fn inject_event(
        &mut self,
        ev: GuestEvent,
        vector: u8,
        errcode: u32,
        deliver_errcode: bool,
    ) -> Result<(), HvmError>;

    /// Is an injected event still pending delivery?
    fn pending_event(&self) -> bool;

    /// Is the guest in an interrupt shadow (mov ss / sti slot)?
    fn intr_shadow(&self) -> bool;

    fn guest_intr_enabled(&self) -> bool {
        self.get_reg(GuestReg::Eflags)
            .map(|f| f & GUEST_FL_IF != 0)
            .unwrap_or(false)
    }

    fn intercept_ioport(&mut self, port: u16, enable: bool);
    fn intercept_msr(&mut self, msr: u32, enable: bool);
    fn intercept_intr_window(&mut self, enable: bool);

    /// Map one guest-physical page onto a host-physical page.
    fn set_mmap(&mut self, gpa: u32, hpa: u32, ctype: CacheType) -> Result<(), HvmError>;

    /// Resolve a guest-physical address through the nested table.
    fn translate_gpa(&self, gpa: u32) -> Option<u32>;

    fn set_tsc_offset(&mut self, offset: u64);
}

struct VmState {
    owner: Pid,
    exit_reason: ExitReason,
    exit_info: ExitInfo,
    /// Host TSC at VM creation; the guest sees TSC - base.
    tsc_base: u64,
    in_guest: bool,
    memsize: u32,
    /// Vector handed in by notify_irq, waiting for injection.
    notified_irq: Option<u8>,
}

struct VmSlot {
    state: SpinLock<Option<VmState>>,
    vendor: SpinLock<Option<Box<dyn VendorVm>>>,
    vdev: SpinLock<vdev::Vdev>,
    vpic: SpinLock<vpic::Vpic>,
}

impl VmSlot {
    const fn vacant() -> Self {
        VmSlot {
            state: SpinLock::new(None),
            vendor: SpinLock::new(None),
            vdev: SpinLock::new(vdev::Vdev::vacant()),
            vpic: SpinLock::new(vpic::Vpic::new()),
        }
    }
}

#[allow(clippy::declare_interior_mutable_const)]
const SLOT_INIT: VmSlot = VmSlot::vacant();

static VM_POOL: [VmSlot; MAX_VMID] = [SLOT_INIT; MAX_VMID];

fn slot(vmid: usize) -> Result<&'static VmSlot, HvmError> {
    VM_POOL.get(vmid).ok_or(HvmError::NoSlot)
}

fn live_slot(vmid: usize) -> Result<&'static VmSlot, HvmError> {
    let s = slot(vmid)?;
    if s.state.lock().is_none() {
        return Err(HvmError::NoSlot);
    }
    Ok(s)
}

/// Is hardware virtualization usable on this processor?
pub fn available() -> bool {
    crate::arch::x86::cpu_vendor().is_some()
}

/// Create a VM owned by `owner`, with the vendor chosen by CPUID.
pub fn create_vm(pool: &'static PhysPool, owner: Pid) -> Result<usize, HvmError> {
    let vendor: Box<dyn VendorVm> = match crate::arch::x86::cpu_vendor() {
        Some(CpuVendor::Amd) => Box::new(svm::SvmVm::new(pool)?),
        Some(CpuVendor::Intel) => Box::new(vmx::VmxVm::new(pool)?),
        None => return Err(HvmError::NotSupported),
    };
    create_vm_with(owner, vendor)
}

/// Create a VM with an explicit vendor backend. The seam the boot path
/// and the tests share.
pub fn create_vm_with(owner: Pid, vendor: Box<dyn VendorVm>) -> Result<usize, HvmError> {
    let mut vendor = Some(vendor);
    for (vmid, s) in VM_POOL.iter().enumerate() {
        // Claim the slot first and on its own; the vendor lock is
        // never taken under the state lock.
        {
            let mut state = s.state.lock();
            if state.is_some() {
                continue;
            }
            *state = Some(VmState {
                owner,
                exit_reason: ExitReason::None,
                exit_info: ExitInfo::None,
                tsc_base: cpu::rdtsc(),
                in_guest: false,
                memsize: GUEST_PHY_MEMORY_SIZE,
                notified_irq: None,
            });
        }
        *s.vendor.lock() = vendor.take();
        s.vdev.lock().reset();
        *s.vpic.lock() = vpic::Vpic::new();
        crate::proc::with_proc(owner, |p| p.vmid = Some(vmid));
        log::info!("hvm: vm {} created for pid {}", vmid, owner);
        return Ok(vmid);
    }
    Err(HvmError::NoSlot)
}

/// Tear a VM down and vacate its slot.
pub fn destroy_vm(vmid: usize) -> Result<(), HvmError> {
    let s = live_slot(vmid)?;
    let owner = with_state(vmid, |st| st.owner)?;
    *s.vendor.lock() = None;
    *s.state.lock() = None;
    s.vdev.lock().reset();
    crate::proc::with_proc(owner, |p| p.vmid = None);
    Ok(())
}

fn with_state<R>(vmid: usize, f: impl FnOnce(&mut VmState) -> R) -> Result<R, HvmError> {
    let s = slot(vmid)?;
    let mut state = s.state.lock();
    state.as_mut().map(f).ok_or(HvmError::NoSlot)
}

/// Run `f` against the vendor backend of a live VM.
pub fn with_vendor<R>(
    vmid: usize,
    f: impl FnOnce(&mut dyn VendorVm) -> R,
) -> Result<R, HvmError> {
    let s = live_slot(vmid)?;
    let mut vendor = s.vendor.lock();
    vendor
        .as_mut()
        .map(|v| f(v.as_mut()))
        .ok_or(HvmError::NoSlot)
}

pub fn owner_of(vmid: usize) -> Result<Pid, HvmError> {
    with_state(vmid, |st| st.owner)
}

pub fn last_exit(vmid: usize) -> Result<(ExitReason, ExitInfo), HvmError> {
    with_state(vmid, |st| (st.exit_reason, st.exit_info))
}

/* The vendor-independent control surface. */

pub fn set_reg(vmid: usize, reg: GuestReg, val: u32) -> Result<(), HvmError> {
    with_vendor(vmid, |v| v.set_reg(reg, val))?
}

pub fn get_reg(vmid: usize, reg: GuestReg) -> Result<u32, HvmError> {
    with_vendor(vmid, |v| v.get_reg(reg))?
}

pub fn set_desc(vmid: usize, seg: GuestSeg, desc: &GuestSegDesc) -> Result<(), HvmError> {
    with_vendor(vmid, |v| v.set_desc(seg, desc))?
}

pub fn get_desc(vmid: usize, seg: GuestSeg) -> Result<GuestSegDesc, HvmError> {
    with_vendor(vmid, |v| v.get_desc(seg))?
}

pub fn get_next_eip(vmid: usize, instr: GuestInstr) -> Result<u32, HvmError> {
    with_vendor(vmid, |v| v.get_next_eip(instr))?
}

pub fn inject_event(
    vmid: usize,
    ev: GuestEvent,
    vector: u8,
    errcode: u32,
    deliver_errcode: bool,
) -> Result<(), HvmError> {
    with_vendor(vmid, |v| v.inject_event(ev, vector, errcode, deliver_errcode))?
}

pub fn pending_event(vmid: usize) -> Result<bool, HvmError> {
    with_vendor(vmid, |v| v.pending_event())
}

pub fn intr_shadow(vmid: usize) -> Result<bool, HvmError> {
    with_vendor(vmid, |v| v.intr_shadow())
}

pub fn intercept_ioport(vmid: usize, port: u16, enable: bool) -> Result<(), HvmError> {
    with_vendor(vmid, |v| v.intercept_ioport(port, enable))
}

pub fn intercept_msr(vmid: usize, msr: u32, enable: bool) -> Result<(), HvmError> {
    with_vendor(vmid, |v| v.intercept_msr(msr, enable))
}

pub fn intercept_intr_window(vmid: usize, enable: bool) -> Result<(), HvmError> {
    with_vendor(vmid, |v| v.intercept_intr_window(enable))
}

pub fn set_mmap(vmid: usize, gpa: u32, hpa: u32, ctype: CacheType) -> Result<(), HvmError> {
    with_vendor(vmid, |v| v.set_mmap(gpa, hpa, ctype))?
}

/// Guest-visible TSC value.
pub fn guest_tsc(vmid: usize) -> Result<u64, HvmError> {
    let base = with_state(vmid, |st| st.tsc_base)?;
    Ok(cpu::rdtsc().wrapping_sub(base))
}

pub fn guest_tsc_freq() -> u64 {
    GUEST_TSC_FREQ
}

pub fn guest_mem_size(vmid: usize) -> Result<u32, HvmError> {
    with_state(vmid, |st| st.memsize)
}

/// Record a vector the user-mode PIC wants delivered.
pub fn set_notified_irq(vmid: usize, vector: u8) -> Result<(), HvmError> {
    with_state(vmid, |st| st.notified_irq = Some(vector))
}

/// Inject a deliverable pending interrupt, or arm the interrupt window
/// when one is pending but the guest cannot take it yet.
fn deliver_pending(vmid: usize) -> Result<(), HvmError> {
    let s = live_slot(vmid)?;

    let notified = with_state(vmid, |st| st.notified_irq.take())?;
    let pic_delegated = s.vdev.lock().pic_owner().is_some();

    // Peek whichever source is live before bothering the vendor.
    let vector_waiting = notified.is_some()
        || (!pic_delegated && s.vpic.lock().peep_intout().is_some());
    if !vector_waiting {
        return Ok(());
    }

    with_vendor(vmid, |v| -> Result<(), HvmError> {
        if v.guest_intr_enabled() && !v.intr_shadow() && !v.pending_event() {
            let vector = match notified {
                Some(vec) => Some(vec),
                None => s.vpic.lock().read_intout(),
            };
            if let Some(vec) = vector {
                v.inject_event(GuestEvent::ExtIntr, vec, 0, false)?;
            }
        } else {
            // Not deliverable yet: put it back and watch for the window.
            if let Some(vec) = notified {
                let _ = with_state(vmid, |st| st.notified_irq = Some(vec));
            }
            v.intercept_intr_window(true);
        }
        Ok(())
    })?
}

/// The VM-exit dispatch loop. Returns only when the guest reaches a
/// state the monitor cannot resume; the caller terminates the owner.
pub fn run_vm(pool: &PhysPool, vmid: usize, caller: Pid) -> Result<(), HvmError> {
    if owner_of(vmid)? != caller {
        return Err(HvmError::NotOwner);
    }

    with_state(vmid, |st| st.in_guest = true)?;
    let result = run_loop(pool, vmid);
    with_state(vmid, |st| st.in_guest = false)?;

    if let Err(e) = &result {
        log::warn!("hvm: vm {} stopped: {}", vmid, e);
    }
    result
}

fn run_loop(pool: &PhysPool, vmid: usize) -> Result<(), HvmError> {
    loop {
        deliver_pending(vmid)?;

        let (reason, info) = with_vendor(vmid, |v| v.run())??;
        with_state(vmid, |st| {
            st.exit_reason = reason;
            st.exit_info = info;
        })?;

        match reason {
            ExitReason::ExtIntr => {
                // Let the host take the interrupt that kicked us out,
                // then resume.
                cpu::intr_enable();
                core::hint::spin_loop();
                cpu::intr_disable();
            }
            ExitReason::IntrWindow => {
                with_vendor(vmid, |v| v.intercept_intr_window(false))?;
            }
            ExitReason::Ioport => {
                let ExitInfo::Ioport(io) = info else {
                    return Err(HvmError::ExitFault);
                };
                handle_ioport(vmid, io)?;
                advance_eip(vmid, if io.write { GuestInstr::Out } else { GuestInstr::In })?;
            }
            ExitReason::PageFault => {
                let ExitInfo::PageFault { gpa } = info else {
                    return Err(HvmError::ExitFault);
                };
                handle_nested_fault(pool, vmid, gpa)?;
            }
            ExitReason::Cpuid => {
                emulate_cpuid(vmid)?;
                advance_eip(vmid, GuestInstr::Cpuid)?;
            }
            ExitReason::Rdtsc => {
                let tsc = guest_tsc(vmid)?;
                with_vendor(vmid, |v| -> Result<(), HvmError> {
                    v.set_reg(GuestReg::Eax, tsc as u32)?;
                    v.set_reg(GuestReg::Edx, (tsc >> 32) as u32)
                })??;
                advance_eip(vmid, GuestInstr::Rdtsc)?;
            }
            ExitReason::Rdmsr => {
                // No MSRs are exposed; reads see zero.
                with_vendor(vmid, |v| -> Result<(), HvmError> {
                    v.set_reg(GuestReg::Eax, 0)?;
                    v.set_reg(GuestReg::Edx, 0)
                })??;
                advance_eip(vmid, GuestInstr::Rdmsr)?;
            }
            ExitReason::Wrmsr => {
                // Writes are accepted and dropped.
                advance_eip(vmid, GuestInstr::Wrmsr)?;
            }
            ExitReason::Hlt => {
                // Halted with nothing deliverable: yield the CPU once;
                // the next iteration injects whatever arrived.
                crate::proc::sched::yield_cpu();
            }
            ExitReason::InvalInstr => {
                // Reflect #UD back into the guest.
                with_vendor(vmid, |v| v.inject_event(GuestEvent::Exception, 6, 0, false))??;
            }
            ExitReason::Shutdown | ExitReason::None | ExitReason::Invalid => {
                return Err(HvmError::ExitFault);
            }
        }
    }
}

fn advance_eip(vmid: usize, instr: GuestInstr) -> Result<(), HvmError> {
    with_vendor(vmid, |v| -> Result<(), HvmError> {
        let next = v.get_next_eip(instr)?;
        v.set_reg(GuestReg::Eip, next)
    })?
}

/// Route a port access to its owning device, or emulate the unowned
/// default: reads float high, writes vanish.
fn handle_ioport(vmid: usize, io: IoportExit) -> Result<(), HvmError> {
    let s = live_slot(vmid)?;
    let owner = s.vdev.lock().port_owner(io.port, io.write);
    match owner {
        Some((vid, width)) => {
            let owner_pid = owner_of(vmid)?;
            if io.write {
                let val = read_guest_ioport_reg(vmid, io.width)?;
                vdev::forward_write(s, vid, io.port, width, val, owner_pid)
            } else {
                let val = vdev::forward_read(s, vid, io.port, width, owner_pid)?;
                write_guest_ioport_reg(vmid, io.width, val)
            }
        }
        None => {
            if !io.write {
                write_guest_ioport_reg(vmid, io.width, 0xFFFF_FFFF)?;
            }
            Ok(())
        }
    }
}

/// Merge an inbound value into guest EAX according to access width.
fn write_guest_ioport_reg(vmid: usize, width: DataSz, val: u32) -> Result<(), HvmError> {
    with_vendor(vmid, |v| -> Result<(), HvmError> {
        let old = v.get_reg(GuestReg::Eax)?;
        let merged = (old & !width.mask()) | (val & width.mask());
        v.set_reg(GuestReg::Eax, merged)
    })?
}

fn read_guest_ioport_reg(vmid: usize, width: DataSz) -> Result<u32, HvmError> {
    Ok(get_reg(vmid, GuestReg::Eax)? & width.mask())
}

/// Nested page fault policy: RAM below the guest memory size is mapped
/// lazily from the pool; anything else is fatal for the VM.
fn handle_nested_fault(pool: &PhysPool, vmid: usize, gpa: u32) -> Result<(), HvmError> {
    let memsize = guest_mem_size(vmid)?;
    if gpa >= memsize {
        let s = live_slot(vmid)?;
        if s.vdev.lock().mmio_owner(gpa).is_some() {
            // Device-owned memory: nothing establishes a mapping here;
            // the access protocol for MMIO regions is unimplemented.
            log::warn!("hvm: vm {} touched device memory {:#010x}", vmid, gpa);
        }
        return Err(HvmError::ExitFault);
    }
    let frame = pool.alloc_page().map_err(|_| HvmError::NoMem)?;
    pool.zero_frame(frame);
    set_mmap(vmid, page_down(gpa), frame.addr().as_u32(), CacheType::WriteBack)
}

/// CPUID emulation: mostly the host's answers with the virtualization
/// feature bits scrubbed.
fn emulate_cpuid(vmid: usize) -> Result<(), HvmError> {
    const CPUID_FEAT_ECX_VMX: u32 = 1 << 5;
    const CPUID_FEAT_ECX_HYPERVISOR: u32 = 1 << 31;

    let leaf = get_reg(vmid, GuestReg::Eax)?;
    let subleaf = get_reg(vmid, GuestReg::Ecx)?;
    let (eax, ebx, mut ecx, edx) = cpu::cpuid(leaf, subleaf);
    if leaf == 1 {
        ecx &= !CPUID_FEAT_ECX_VMX;
        ecx |= CPUID_FEAT_ECX_HYPERVISOR;
    }
    with_vendor(vmid, |v| -> Result<(), HvmError> {
        v.set_reg(GuestReg::Eax, eax)?;
        v.set_reg(GuestReg::Ebx, ebx)?;
        v.set_reg(GuestReg::Ecx, ecx)?;
        v.set_reg(GuestReg::Edx, edx)
    })?
}

/* Virtual-device plumbing shared with the syscall layer. */

/// Register the calling process as a device of this VM.
pub fn register_device(
    vmid: usize,
    pid: Pid,
    req_ch: crate::ipc::ChannelId,
    sync_ch: crate::ipc::ChannelId,
) -> Result<u8, HvmError> {
    let s = live_slot(vmid)?;
    let vid = s.vdev.lock().register_device(pid, req_ch, sync_ch)?;
    crate::proc::with_proc(pid, |p| p.vdev = Some((vmid, vid)));
    Ok(vid)
}

pub fn unregister_device(vmid: usize, vid: u8) -> Result<(), HvmError> {
    let s = live_slot(vmid)?;
    let pid = s.vdev.lock().unregister_device(vid)?;
    crate::proc::with_proc(pid, |p| p.vdev = None);
    Ok(())
}

/// Access the vdev tables of a live VM.
pub fn with_vdev<R>(vmid: usize, f: impl FnOnce(&mut vdev::Vdev) -> R) -> Result<R, HvmError> {
    let s = live_slot(vmid)?;
    Ok(f(&mut s.vdev.lock()))
}

/// Access the virtual PIC of a live VM.
pub fn with_vpic<R>(vmid: usize, f: impl FnOnce(&mut vpic::Vpic) -> R) -> Result<R, HvmError> {
    let s = live_slot(vmid)?;
    Ok(f(&mut s.vpic.lock()))
}

/// Assert, deassert or pulse a guest IRQ on behalf of device `vid`.
pub fn set_irq(vmid: usize, vid: u8, irq: u8, mode: vpic::IrqMode) -> Result<(), HvmError> {
    let s = live_slot(vmid)?;
    {
        let vdev = s.vdev.lock();
        if vdev.irq_owner(irq) != Some(vid) {
            return Err(HvmError::NotOwner);
        }
    }
    s.vpic.lock().set_irq(irq, mode);
    Ok(())
}

/// The PIC owner notifies that its INT line computed `irq`.
pub fn notify_irq(vmid: usize, vid: u8, irq: u8) -> Result<(), HvmError> {
    let s = live_slot(vmid)?;
    {
        let vdev = s.vdev.lock();
        if vdev.pic_owner() != Some(vid) {
            return Err(HvmError::NotOwner);
        }
    }
    set_notified_irq(vmid, irq)
}

/// Copy between guest physical memory and a device process's address
/// space. `to_guest` picks the direction.
pub fn copy_guest(
    pool: &PhysPool,
    vmid: usize,
    gpa: u32,
    pmap: &crate::mm::Pmap,
    la: u32,
    size: u32,
    to_guest: bool,
) -> Result<(), HvmError> {
    if size == 0 {
        return Err(HvmError::BadArg);
    }
    if !pmap.checkrange(pool, la, size) {
        return Err(HvmError::BadArg);
    }
    let mut done = 0u32;
    while done < size {
        let g = gpa.checked_add(done).ok_or(HvmError::BadArg)?;
        let hpa = with_vendor(vmid, |v| v.translate_gpa(g))?.ok_or(HvmError::BadArg)?;
        let l = la + done;
        let pte = pmap.lookup(pool, l).ok_or(HvmError::BadArg)?;
        let l_pa = (pte & !0xFFF) + crate::mm::page_off(l);
        let chunk = (size - done)
            .min(PAGE_SIZE as u32 - crate::mm::page_off(g))
            .min(PAGE_SIZE as u32 - crate::mm::page_off(l));
        // SAFETY: Both sides resolve into pool frames; chunk stays
        // inside one page on each side.
        unsafe {
            let g_ptr = pool.phys_ptr(crate::mm::PhysAddr::new(hpa + crate::mm::page_off(g)));
            let l_ptr = pool.phys_ptr(crate::mm::PhysAddr::new(l_pa));
            if to_guest {
                core::ptr::copy(l_ptr, g_ptr, chunk as usize);
            } else {
                core::ptr::copy(g_ptr, l_ptr, chunk as usize);
            }
        }
        done += chunk;
    }
    Ok(())
}

// The scripted backend doubles as the integration tests' guest, so it
// is part of the host build rather than test-only.
#[cfg(not(target_os = "none"))]
pub mod mock;

#[cfg(test)]
mod tests;
