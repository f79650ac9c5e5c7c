//! Intel VMX backend.
//!
//! Guest state is carried in a host-side shadow and written through to
//! the VMCS around each entry; the shadow is the read path for the
//! control surface, which keeps VMREAD traffic off the hot paths and
//! leaves the whole backend exercisable where no VMX hardware exists.
//! First entry is vmlaunch, every later one vmresume.

pub mod ept;
pub mod vmcs;

use ept::EptPtab;

use super::{
    CacheType, DataSz, ExitInfo, ExitReason, GuestEvent, GuestInstr, GuestReg, GuestSeg,
    GuestSegDesc, IoportExit, VendorVm, GUEST_FL_IF,
};
use crate::{
    error::HvmError,
    mm::{FrameNumber, PhysPool, PAGE_SIZE},
};

const NSEGS: usize = 10;

/// Host-side copy of the guest register file.
#[derive(Debug, Clone, Copy)]
struct GuestShadow {
    /// eax, ebx, ecx, edx, esi, edi, ebp: not VMCS fields; the entry
    /// stub shuttles them.
    gp: [u32; 7],
    esp: u32,
    eip: u32,
    eflags: u32,
    cr0: u32,
    cr2: u32,
    cr3: u32,
    cr4: u32,
    segs: [GuestSegDesc; NSEGS],
    interruptibility: u32,
    entry_intr_info: u32,
    entry_errcode: u32,
    pin_ctls: u32,
    proc_ctls: u32,
    proc2_ctls: u32,
    tsc_offset: u64,
}

impl GuestShadow {
    /// Architectural reset state, mirroring the SVM side.
    fn reset() -> Self {
        let mut segs = [GuestSegDesc::default(); NSEGS];
        let data = GuestSegDesc {
            sel: 0,
            base: 0,
            lim: 0xFFFF,
            ar: 0x0093,
        };
        for s in segs.iter_mut() {
            *s = data;
        }
        segs[seg_index(GuestSeg::Cs)] = GuestSegDesc {
            sel: 0xF000,
            base: 0xF_0000,
            lim: 0xFFFF,
            ar: 0x009B,
        };
        segs[seg_index(GuestSeg::Ldtr)] = GuestSegDesc {
            sel: 0,
            base: 0,
            lim: 0xFFFF,
            ar: 0x0082,
        };
        segs[seg_index(GuestSeg::Tr)] = GuestSegDesc {
            sel: 0,
            base: 0,
            lim: 0xFFFF,
            ar: 0x008B,
        };
        GuestShadow {
            gp: [0; 7],
            esp: 0,
            eip: 0xFFF0,
            eflags: 1 << 1,
            cr0: 0x6000_0010,
            cr2: 0,
            cr3: 0,
            cr4: 0,
            segs,
            interruptibility: 0,
            entry_intr_info: 0,
            entry_errcode: 0,
            pin_ctls: vmcs::PIN_EXTINT_EXITING | vmcs::PIN_NMI_EXITING,
            proc_ctls: vmcs::PROC_HLT_EXITING
                | vmcs::PROC_INVLPG_EXITING
                | vmcs::PROC_RDTSC_EXITING
                | vmcs::PROC_USE_IO_BITMAPS
                | vmcs::PROC_USE_MSR_BITMAPS
                | vmcs::PROC_SECONDARY_CTLS,
            proc2_ctls: vmcs::PROC2_ENABLE_EPT | vmcs::PROC2_UNRESTRICTED_GUEST,
            tsc_offset: 0,
        }
    }
}

fn seg_index(seg: GuestSeg) -> usize {
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

/// One VMX-backed virtual machine.
pub struct VmxVm {
    pool: &'static PhysPool,
    vmcs_frame: FrameNumber,
    io_bitmap_a: FrameNumber,
    io_bitmap_b: FrameNumber,
    msr_bitmap: FrameNumber,
    ept: Option<EptPtab>,
    guest: GuestShadow,
    launched: bool,
    /// Raw exit state captured after each vmexit.
    exit_reason: u32,
    exit_qual: u64,
    exit_instr_len: u32,
    exit_guest_phys: u64,
}

impl VmxVm {
    pub fn new(pool: &'static PhysPool) -> Result<Self, HvmError> {
        let vmcs_frame = alloc_one(pool)?;
        let io_bitmap_a = alloc_one(pool)?;
        let io_bitmap_b = alloc_one(pool)?;
        let msr_bitmap = alloc_one(pool)?;
        let ept = EptPtab::new(pool)?;

        let vm = VmxVm {
            pool,
            vmcs_frame,
            io_bitmap_a,
            io_bitmap_b,
            msr_bitmap,
            ept: Some(ept),
            guest: GuestShadow::reset(),
            launched: false,
            exit_reason: 0,
            exit_qual: 0,
            exit_instr_len: 0,
            exit_guest_phys: 0,
        };
        // All ones: every port and MSR access exits until claimed.
        for f in [vm.io_bitmap_a, vm.io_bitmap_b, vm.msr_bitmap] {
            // SAFETY: Freshly allocated pool frames owned here.
            unsafe { core::ptr::write_bytes(pool.frame_ptr(f), 0xFF, PAGE_SIZE) };
        }
        Ok(vm)
    }

    fn ept(&self) -> &EptPtab {
        self.ept.as_ref().expect("EPT taken before drop")
    }

    fn classify(&self) -> (ExitReason, ExitInfo) {
        match self.exit_reason & 0xFFFF {
            vmcs::EXIT_REASON_EXTERNAL_INTERRUPT => (ExitReason::ExtIntr, ExitInfo::None),
            vmcs::EXIT_REASON_INTERRUPT_WINDOW => (ExitReason::IntrWindow, ExitInfo::None),
            vmcs::EXIT_REASON_IO_INSTRUCTION => {
                match vmcs::decode_io_qualification(self.exit_qual) {
                    Some(io) => (
                        ExitReason::Ioport,
                        ExitInfo::Ioport(IoportExit {
                            port: io.port,
                            width: io.sz,
                            write: !io.input,
                            rep: io.rep,
                            str_op: io.str_op,
                        }),
                    ),
                    None => (ExitReason::Invalid, ExitInfo::None),
                }
            }
            vmcs::EXIT_REASON_EPT_VIOLATION => (
                ExitReason::PageFault,
                ExitInfo::PageFault {
                    gpa: self.exit_guest_phys as u32,
                },
            ),
            vmcs::EXIT_REASON_CPUID => (ExitReason::Cpuid, ExitInfo::None),
            vmcs::EXIT_REASON_RDTSC | vmcs::EXIT_REASON_RDTSCP => {
                (ExitReason::Rdtsc, ExitInfo::None)
            }
            vmcs::EXIT_REASON_RDMSR => (ExitReason::Rdmsr, ExitInfo::None),
            vmcs::EXIT_REASON_WRMSR => (ExitReason::Wrmsr, ExitInfo::None),
            vmcs::EXIT_REASON_HLT => (ExitReason::Hlt, ExitInfo::None),
            vmcs::EXIT_REASON_TRIPLE_FAULT => (ExitReason::Shutdown, ExitInfo::None),
            vmcs::EXIT_REASON_VMCALL..=vmcs::EXIT_REASON_VMXON => {
                (ExitReason::InvalInstr, ExitInfo::None)
            }
            other => {
                log::warn!("vmx: unclassified exit {}", other);
                (ExitReason::Invalid, ExitInfo::None)
            }
        }
    }

    fn bitmap_bit(&self, port: u16) -> (FrameNumber, usize, u8) {
        let (frame, off) = if port < 0x8000 {
            (self.io_bitmap_a, port as usize)
        } else {
            (self.io_bitmap_b, port as usize - 0x8000)
        };
        (frame, off / 8, 1 << (off % 8))
    }
}

impl Drop for VmxVm {
    fn drop(&mut self) {
        for f in [self.vmcs_frame, self.io_bitmap_a, self.io_bitmap_b, self.msr_bitmap] {
            self.pool.decref(f);
        }
        if let Some(ept) = self.ept.take() {
            ept.destroy(self.pool);
        }
    }
}

impl VendorVm for VmxVm {
    fn run(&mut self) -> Result<(ExitReason, ExitInfo), HvmError> {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        {
            hw::enter(self)?;
            return Ok(self.classify());
        }
        #[cfg(not(all(target_arch = "x86", target_os = "none")))]
        return Err(HvmError::NotSupported);
    }

    fn set_reg(&mut self, reg: GuestReg, val: u32) -> Result<(), HvmError> {
        match reg {
            GuestReg::Eax => self.guest.gp[0] = val,
            GuestReg::Ebx => self.guest.gp[1] = val,
            GuestReg::Ecx => self.guest.gp[2] = val,
            GuestReg::Edx => self.guest.gp[3] = val,
            GuestReg::Esi => self.guest.gp[4] = val,
            GuestReg::Edi => self.guest.gp[5] = val,
            GuestReg::Ebp => self.guest.gp[6] = val,
            GuestReg::Esp => self.guest.esp = val,
            GuestReg::Eip => self.guest.eip = val,
            GuestReg::Eflags => self.guest.eflags = val,
            GuestReg::Cr0 => self.guest.cr0 = val,
            GuestReg::Cr2 => self.guest.cr2 = val,
            GuestReg::Cr3 => self.guest.cr3 = val,
            GuestReg::Cr4 => self.guest.cr4 = val,
        }
        Ok(())
    }

    fn get_reg(&self, reg: GuestReg) -> Result<u32, HvmError> {
        Ok(match reg {
            GuestReg::Eax => self.guest.gp[0],
            GuestReg::Ebx => self.guest.gp[1],
            GuestReg::Ecx => self.guest.gp[2],
            GuestReg::Edx => self.guest.gp[3],
            GuestReg::Esi => self.guest.gp[4],
            GuestReg::Edi => self.guest.gp[5],
            GuestReg::Ebp => self.guest.gp[6],
            GuestReg::Esp => self.guest.esp,
            GuestReg::Eip => self.guest.eip,
            GuestReg::Eflags => self.guest.eflags,
            GuestReg::Cr0 => self.guest.cr0,
            GuestReg::Cr2 => self.guest.cr2,
            GuestReg::Cr3 => self.guest.cr3,
            GuestReg::Cr4 => self.guest.cr4,
        })
    }

    fn set_desc(&mut self, seg: GuestSeg, desc: &GuestSegDesc) -> Result<(), HvmError> {
        self.guest.segs[seg_index(seg)] = *desc;
        Ok(())
    }

    fn get_desc(&self, seg: GuestSeg) -> Result<GuestSegDesc, HvmError> {
        Ok(self.guest.segs[seg_index(seg)])
    }

    fn get_next_eip(&self, _instr: GuestInstr) -> Result<u32, HvmError> {
        if self.exit_instr_len == 0 {
            return Err(HvmError::ExitFault);
        }
        Ok(self.guest.eip.wrapping_add(self.exit_instr_len))
    }

    fn inject_event(
        &mut self,
        ev: GuestEvent,
        vector: u8,
        errcode: u32,
        deliver_errcode: bool,
    ) -> Result<(), HvmError> {
        let typ = match ev {
            GuestEvent::ExtIntr => vmcs::ENTRY_INTR_TYPE_EXTINT,
            GuestEvent::Nmi => vmcs::ENTRY_INTR_TYPE_NMI,
            GuestEvent::Exception => vmcs::ENTRY_INTR_TYPE_HW_EXCEPTION,
            GuestEvent::SwInt => vmcs::ENTRY_INTR_TYPE_SW_INT,
        };
        let mut info = vector as u32 | typ | vmcs::ENTRY_INTR_INFO_VALID;
        if deliver_errcode {
            info |= vmcs::ENTRY_INTR_DELIVER_ERRCODE;
        }
        self.guest.entry_intr_info = info;
        self.guest.entry_errcode = errcode;
        Ok(())
    }

    fn pending_event(&self) -> bool {
        self.guest.entry_intr_info & vmcs::ENTRY_INTR_INFO_VALID != 0
    }

    fn intr_shadow(&self) -> bool {
        self.guest.interruptibility
            & (vmcs::INTR_STATE_STI_BLOCKING | vmcs::INTR_STATE_MOV_SS_BLOCKING)
            != 0
    }

    fn guest_intr_enabled(&self) -> bool {
        self.guest.eflags & GUEST_FL_IF != 0
    }

    fn intercept_ioport(&mut self, port: u16, enable: bool) {
        let (frame, byte, mask) = self.bitmap_bit(port);
        // SAFETY: Bitmap frames are pool-backed and owned here.
        unsafe {
            let p = self.pool.frame_ptr(frame).add(byte);
            if enable {
                *p |= mask;
            } else {
                *p &= !mask;
            }
        }
    }

    fn intercept_msr(&mut self, msr: u32, enable: bool) {
        // MSR bitmap page: read-low, read-high, write-low, write-high
        // in 1 KiB quarters.
        let (lo_off, idx) = match msr {
            0..=0x1FFF => (0usize, msr as usize),
            0xC000_0000..=0xC000_1FFF => (1024, (msr - 0xC000_0000) as usize),
            _ => return,
        };
        for base in [lo_off, lo_off + 2048] {
            let byte = base + idx / 8;
            let mask = 1u8 << (idx % 8);
            // SAFETY: See intercept_ioport.
            unsafe {
                let p = self.pool.frame_ptr(self.msr_bitmap).add(byte);
                if enable {
                    *p |= mask;
                } else {
                    *p &= !mask;
                }
            }
        }
    }

    fn intercept_intr_window(&mut self, enable: bool) {
        if enable {
            self.guest.proc_ctls |= vmcs::PROC_INTR_WINDOW_EXITING;
        } else {
            self.guest.proc_ctls &= !vmcs::PROC_INTR_WINDOW_EXITING;
        }
    }

    fn set_mmap(&mut self, gpa: u32, hpa: u32, ctype: CacheType) -> Result<(), HvmError> {
        self.ept().set_mmap(self.pool, gpa, hpa, ctype)
    }

    fn translate_gpa(&self, gpa: u32) -> Option<u32> {
        self.ept().translate(self.pool, gpa)
    }

    fn set_tsc_offset(&mut self, offset: u64) {
        self.guest.tsc_offset = offset;
    }
}

fn alloc_one(pool: &PhysPool) -> Result<FrameNumber, HvmError> {
    let f = pool.alloc_page().map_err(HvmError::from)?;
    pool.incref(f);
    pool.zero_frame(f);
    Ok(f)
}

/// Enable VMX operation on this CPU; the boot path calls it once per
/// processor with a dedicated VMXON page.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use hw::hw_init;

/// Hardware entry/exit path.
#[cfg(all(target_arch = "x86", target_os = "none"))]
mod hw {
    use super::*;
    use crate::arch::x86::cpu;

    const IA32_VMX_BASIC: u32 = 0x480;
    const IA32_FEATURE_CONTROL: u32 = 0x3A;
    const CR4_VMXE_BIT: u32 = 1 << 13;

    #[inline]
    fn vmwrite(field: u32, val: u64) -> Result<(), HvmError> {
        let ok: u8;
        // SAFETY: vmwrite faults only outside VMX operation, which
        // hw_init establishes.
        unsafe {
            core::arch::asm!(
                "vmwrite {0:e}, {1:e}",
                "setna {2}",
                in(reg) field,
                in(reg) val as u32,
                out(reg_byte) ok,
            )
        };
        if ok != 0 {
            return Err(HvmError::ExitFault);
        }
        Ok(())
    }

    #[inline]
    fn vmread(field: u32) -> u64 {
        let val: u32;
        // SAFETY: See vmwrite.
        unsafe {
            core::arch::asm!(
                "vmread {1:e}, {0:e}",
                in(reg) field,
                out(reg) val,
            )
        };
        val as u64
    }

    /// Enable VMX operation on the calling CPU with the given VMXON
    /// region.
    pub fn hw_init(vmxon_pa: u32) -> Result<(), HvmError> {
        let (_, _, ecx, _) = cpu::cpuid(1, 0);
        if ecx & (1 << 5) == 0 {
            return Err(HvmError::NotSupported);
        }
        let fc = cpu::rdmsr(IA32_FEATURE_CONTROL);
        if fc & 1 != 0 && fc & (1 << 2) == 0 {
            // Locked with VMX outside SMX disabled.
            return Err(HvmError::NotSupported);
        }

        // SAFETY: CR4.VMXE then vmxon with an initialized region.
        unsafe {
            let mut cr4: u32;
            core::arch::asm!("mov {}, cr4", out(reg) cr4);
            core::arch::asm!("mov cr4, {}", in(reg) cr4 | CR4_VMXE_BIT);

            let rev = cpu::rdmsr(IA32_VMX_BASIC) as u32;
            *(vmxon_pa as *mut u32) = rev;
            let pa = vmxon_pa as u64;
            core::arch::asm!("vmxon [{}]", in(reg) &pa);
        }
        Ok(())
    }

    const SEG_SEL: [u32; NSEGS] = [
        vmcs::GUEST_CS_SELECTOR,
        vmcs::GUEST_DS_SELECTOR,
        vmcs::GUEST_ES_SELECTOR,
        vmcs::GUEST_FS_SELECTOR,
        vmcs::GUEST_GS_SELECTOR,
        vmcs::GUEST_SS_SELECTOR,
        vmcs::GUEST_LDTR_SELECTOR,
        vmcs::GUEST_TR_SELECTOR,
        0,
        0,
    ];
    const SEG_BASE: [u32; NSEGS] = [
        vmcs::GUEST_CS_BASE,
        vmcs::GUEST_DS_BASE,
        vmcs::GUEST_ES_BASE,
        vmcs::GUEST_FS_BASE,
        vmcs::GUEST_GS_BASE,
        vmcs::GUEST_SS_BASE,
        vmcs::GUEST_LDTR_BASE,
        vmcs::GUEST_TR_BASE,
        vmcs::GUEST_GDTR_BASE,
        vmcs::GUEST_IDTR_BASE,
    ];
    const SEG_LIMIT: [u32; NSEGS] = [
        vmcs::GUEST_CS_LIMIT,
        vmcs::GUEST_DS_LIMIT,
        vmcs::GUEST_ES_LIMIT,
        vmcs::GUEST_FS_LIMIT,
        vmcs::GUEST_GS_LIMIT,
        vmcs::GUEST_SS_LIMIT,
        vmcs::GUEST_LDTR_LIMIT,
        vmcs::GUEST_TR_LIMIT,
        vmcs::GUEST_GDTR_LIMIT,
        vmcs::GUEST_IDTR_LIMIT,
    ];
    const SEG_AR: [u32; NSEGS] = [
        vmcs::GUEST_CS_ACCESS_RIGHTS,
        vmcs::GUEST_DS_ACCESS_RIGHTS,
        vmcs::GUEST_ES_ACCESS_RIGHTS,
        vmcs::GUEST_FS_ACCESS_RIGHTS,
        vmcs::GUEST_GS_ACCESS_RIGHTS,
        vmcs::GUEST_SS_ACCESS_RIGHTS,
        vmcs::GUEST_LDTR_ACCESS_RIGHTS,
        vmcs::GUEST_TR_ACCESS_RIGHTS,
        0,
        0,
    ];

    fn flush_shadow(vm: &VmxVm) -> Result<(), HvmError> {
        let g = &vm.guest;
        vmwrite(vmcs::PIN_BASED_VM_EXEC_CONTROLS, g.pin_ctls as u64)?;
        vmwrite(vmcs::PRIMARY_PROC_BASED_VM_EXEC_CONTROLS, g.proc_ctls as u64)?;
        vmwrite(vmcs::SECONDARY_PROC_BASED_VM_EXEC_CONTROLS, g.proc2_ctls as u64)?;
        vmwrite(vmcs::IO_BITMAP_A, vm.io_bitmap_a.addr().as_u32() as u64)?;
        vmwrite(vmcs::IO_BITMAP_B, vm.io_bitmap_b.addr().as_u32() as u64)?;
        vmwrite(vmcs::MSR_BITMAP, vm.msr_bitmap.addr().as_u32() as u64)?;
        vmwrite(vmcs::EPT_POINTER, vm.ept().eptp())?;
        vmwrite(vmcs::TSC_OFFSET, g.tsc_offset)?;
        vmwrite(vmcs::GUEST_VMCS_LINK_POINTER, u64::MAX)?;

        vmwrite(vmcs::GUEST_CR0, g.cr0 as u64)?;
        vmwrite(vmcs::GUEST_CR3, g.cr3 as u64)?;
        vmwrite(vmcs::GUEST_CR4, g.cr4 as u64)?;
        vmwrite(vmcs::GUEST_RIP, g.eip as u64)?;
        vmwrite(vmcs::GUEST_RSP, g.esp as u64)?;
        vmwrite(vmcs::GUEST_RFLAGS, g.eflags as u64)?;
        vmwrite(vmcs::GUEST_INTERRUPTIBILITY_STATE, g.interruptibility as u64)?;
        vmwrite(vmcs::VM_ENTRY_INTERRUPTION_INFO, g.entry_intr_info as u64)?;
        vmwrite(vmcs::VM_ENTRY_EXCEPTION_ERROR_CODE, g.entry_errcode as u64)?;

        for i in 0..NSEGS {
            let s = g.segs[i];
            if SEG_SEL[i] != 0 {
                vmwrite(SEG_SEL[i], s.sel as u64)?;
            }
            vmwrite(SEG_BASE[i], s.base)?;
            vmwrite(SEG_LIMIT[i], s.lim as u64)?;
            if SEG_AR[i] != 0 {
                vmwrite(SEG_AR[i], s.ar as u64)?;
            }
        }
        Ok(())
    }

    fn pull_shadow(vm: &mut VmxVm) {
        vm.guest.eip = vmread(vmcs::GUEST_RIP) as u32;
        vm.guest.esp = vmread(vmcs::GUEST_RSP) as u32;
        vm.guest.eflags = vmread(vmcs::GUEST_RFLAGS) as u32;
        vm.guest.cr0 = vmread(vmcs::GUEST_CR0) as u32;
        vm.guest.cr3 = vmread(vmcs::GUEST_CR3) as u32;
        vm.guest.cr4 = vmread(vmcs::GUEST_CR4) as u32;
        vm.guest.interruptibility = vmread(vmcs::GUEST_INTERRUPTIBILITY_STATE) as u32;
        // A consumed injection clears its valid bit.
        vm.guest.entry_intr_info = vmread(vmcs::VM_ENTRY_INTERRUPTION_INFO) as u32;
        for i in 0..NSEGS {
            if SEG_SEL[i] != 0 {
                vm.guest.segs[i].sel = vmread(SEG_SEL[i]) as u16;
            }
            vm.guest.segs[i].base = vmread(SEG_BASE[i]);
            vm.guest.segs[i].lim = vmread(SEG_LIMIT[i]) as u32;
            if SEG_AR[i] != 0 {
                vm.guest.segs[i].ar = vmread(SEG_AR[i]) as u32;
            }
        }
        vm.exit_reason = vmread(vmcs::VM_EXIT_REASON) as u32;
        vm.exit_qual = vmread(vmcs::EXIT_QUALIFICATION);
        vm.exit_instr_len = vmread(vmcs::VM_EXIT_INSTRUCTION_LENGTH) as u32;
        vm.exit_guest_phys = vmread(vmcs::GUEST_PHYSICAL_ADDRESS);
    }

    pub fn enter(vm: &mut VmxVm) -> Result<(), HvmError> {
        let vmcs_pa = vm.vmcs_frame.addr().as_u32() as u64;
        // SAFETY: The VMCS frame holds the revision id from creation;
        // vmptrld makes it current on this CPU.
        unsafe {
            if !vm.launched {
                core::arch::asm!("vmclear [{}]", in(reg) &vmcs_pa);
            }
            core::arch::asm!("vmptrld [{}]", in(reg) &vmcs_pa);
        }
        flush_shadow(vm)?;

        // SAFETY: The VMCS is current and the host fields were just
        // written; the stub restores every callee-saved register.
        let failed = unsafe { vmx_enter_asm(&mut vm.guest.gp, vm.launched as u32) };
        if failed != 0 {
            return Err(HvmError::ExitFault);
        }
        vm.launched = true;
        pull_shadow(vm);
        Ok(())
    }

    core::arch::global_asm!(
        // vmx_enter_asm(gp: *mut [u32;7], launched: u32) -> u32
        // Saves host state into the VMCS host fields, loads the guest
        // GP file and launches/resumes. Returns nonzero on a failed
        // entry (VMfail).
        ".globl vmx_enter_asm",
        "vmx_enter_asm:",
        "  push ebp",
        "  push ebx",
        "  push esi",
        "  push edi",
        "  mov ebp, [esp + 20]", // gp pointer
        "  mov ecx, [esp + 24]", // launched flag
        "  push ebp",
        // Host resume point must see the stack exactly as it is now,
        // with the gp pointer on top.
        "  mov eax, 0x6C14", // HOST_RSP
        "  vmwrite eax, esp",
        "  lea edx, [2f]",
        "  mov eax, 0x6C16", // HOST_RIP
        "  vmwrite eax, edx",
        "  test ecx, ecx",
        "  mov eax, [ebp + 0]",
        "  mov ebx, [ebp + 4]",
        "  mov ecx, [ebp + 8]",
        "  mov edx, [ebp + 12]",
        "  mov esi, [ebp + 16]",
        "  mov edi, [ebp + 20]",
        "  mov ebp, [ebp + 24]",
        "  jnz 1f",
        "  vmlaunch",
        "  jmp 3f",
        "1:",
        "  vmresume",
        "3:", // entry failed; the gp pointer is still on top
        "  add esp, 4",
        "  pop edi",
        "  pop esi",
        "  pop ebx",
        "  pop ebp",
        "  mov eax, 1",
        "  ret",
        "2:", // vmexit lands here with host esp restored
        "  xchg ebp, [esp]",
        "  mov [ebp + 0], eax",
        "  mov [ebp + 4], ebx",
        "  mov [ebp + 8], ecx",
        "  mov [ebp + 12], edx",
        "  mov [ebp + 16], esi",
        "  mov [ebp + 20], edi",
        "  pop eax",
        "  mov [ebp + 24], eax",
        "  pop edi",
        "  pop esi",
        "  pop ebx",
        "  pop ebp",
        "  xor eax, eax",
        "  ret",
    );

    extern "C" {
        fn vmx_enter_asm(gp: *mut [u32; 7], launched: u32) -> u32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::testutil;

    fn vm() -> VmxVm {
        VmxVm::new(testutil::pool(48)).unwrap()
    }

    #[test]
    fn reset_state_matches_the_architecture() {
        let vm = vm();
        assert_eq!(vm.get_reg(GuestReg::Eip).unwrap(), 0xFFF0);
        let cs = vm.get_desc(GuestSeg::Cs).unwrap();
        assert_eq!(cs.sel, 0xF000);
        assert_eq!(cs.base, 0xF_0000);
        assert!(!vm.guest_intr_enabled());
        assert!(!vm.intr_shadow());
    }

    #[test]
    fn baseline_controls_arm_the_standard_intercepts() {
        let vm = vm();
        let g = &vm.guest;
        assert!(g.pin_ctls & vmcs::PIN_EXTINT_EXITING != 0);
        for bit in [
            vmcs::PROC_HLT_EXITING,
            vmcs::PROC_INVLPG_EXITING,
            vmcs::PROC_USE_IO_BITMAPS,
            vmcs::PROC_USE_MSR_BITMAPS,
        ] {
            assert!(g.proc_ctls & bit != 0);
        }
        assert!(g.proc2_ctls & vmcs::PROC2_ENABLE_EPT != 0);
        // SAFETY: Arena-backed bitmap frame.
        unsafe {
            assert_eq!(*vm.pool.frame_ptr(vm.io_bitmap_a), 0xFF);
            assert_eq!(*vm.pool.frame_ptr(vm.io_bitmap_b), 0xFF);
        }
    }

    #[test]
    fn io_bitmap_split_covers_the_high_ports() {
        let mut vm = vm();
        vm.intercept_ioport(0x71, false);
        vm.intercept_ioport(0x9000, false);
        // SAFETY: Arena-backed bitmap frames.
        unsafe {
            let a = *vm.pool.frame_ptr(vm.io_bitmap_a).add(0x71 / 8);
            assert_eq!(a & (1 << (0x71 % 8)), 0);
            let off = (0x9000 - 0x8000) / 8;
            let b = *vm.pool.frame_ptr(vm.io_bitmap_b).add(off);
            assert_eq!(b & 1, 0);
        }
    }

    #[test]
    fn classify_decodes_io_and_ept_exits() {
        let mut vm = vm();
        vm.exit_reason = vmcs::EXIT_REASON_IO_INSTRUCTION;
        vm.exit_qual = (0x71 << 16) | (1 << 3);
        vm.exit_instr_len = 2;
        let (reason, info) = vm.classify();
        assert_eq!(reason, ExitReason::Ioport);
        assert_eq!(
            info,
            ExitInfo::Ioport(IoportExit {
                port: 0x71,
                width: DataSz::Sz8,
                write: false,
                rep: false,
                str_op: false,
            })
        );

        vm.guest.eip = 0x7C00;
        assert_eq!(vm.get_next_eip(GuestInstr::In).unwrap(), 0x7C02);

        vm.exit_reason = vmcs::EXIT_REASON_EPT_VIOLATION;
        vm.exit_guest_phys = 0xA_0000;
        let (reason, info) = vm.classify();
        assert_eq!(reason, ExitReason::PageFault);
        assert_eq!(info, ExitInfo::PageFault { gpa: 0xA_0000 });
    }

    #[test]
    fn vmx_family_instructions_are_invalid_in_the_guest() {
        let mut vm = vm();
        for r in [
            vmcs::EXIT_REASON_VMCALL,
            vmcs::EXIT_REASON_VMLAUNCH,
            vmcs::EXIT_REASON_VMXON,
        ] {
            vm.exit_reason = r;
            assert_eq!(vm.classify().0, ExitReason::InvalInstr);
        }
    }

    #[test]
    fn injection_pends_until_the_entry_consumes_it() {
        let mut vm = vm();
        assert!(!vm.pending_event());
        vm.inject_event(GuestEvent::ExtIntr, 0x24, 0, false).unwrap();
        assert!(vm.pending_event());
        assert_eq!(vm.guest.entry_intr_info & 0xFF, 0x24);
    }

    #[test]
    fn interrupt_window_toggles_the_proc_control() {
        let mut vm = vm();
        vm.intercept_intr_window(true);
        assert!(vm.guest.proc_ctls & vmcs::PROC_INTR_WINDOW_EXITING != 0);
        vm.intercept_intr_window(false);
        assert!(vm.guest.proc_ctls & vmcs::PROC_INTR_WINDOW_EXITING == 0);
    }

    #[test]
    fn drop_releases_every_frame() {
        let pool = testutil::pool(48);
        let free0 = pool.free_frames();
        drop(VmxVm::new(pool).unwrap());
        assert_eq!(pool.free_frames(), free0);
    }
}
