//! VMCS field encodings and exit decoding.
//!
//! Field numbers from the Intel SDM Vol. 3C, Appendix B. Only the
//! fields this monitor actually touches are listed, plus the exit
//! reasons and qualification decoding for the intercepts it arms.

#![allow(dead_code)]

/* 16-bit guest fields. */
pub const GUEST_ES_SELECTOR: u32 = 0x0800;
pub const GUEST_CS_SELECTOR: u32 = 0x0802;
pub const GUEST_SS_SELECTOR: u32 = 0x0804;
pub const GUEST_DS_SELECTOR: u32 = 0x0806;
pub const GUEST_FS_SELECTOR: u32 = 0x0808;
pub const GUEST_GS_SELECTOR: u32 = 0x080A;
pub const GUEST_LDTR_SELECTOR: u32 = 0x080C;
pub const GUEST_TR_SELECTOR: u32 = 0x080E;

/* 64-bit control fields. */
pub const IO_BITMAP_A: u32 = 0x2000;
pub const IO_BITMAP_B: u32 = 0x2002;
pub const MSR_BITMAP: u32 = 0x2004;
pub const TSC_OFFSET: u32 = 0x2010;
pub const EPT_POINTER: u32 = 0x201A;
pub const GUEST_PHYSICAL_ADDRESS: u32 = 0x2400;
pub const GUEST_VMCS_LINK_POINTER: u32 = 0x2800;
pub const GUEST_IA32_PAT: u32 = 0x2804;
pub const GUEST_IA32_EFER: u32 = 0x2806;

/* 32-bit control fields. */
pub const PIN_BASED_VM_EXEC_CONTROLS: u32 = 0x4000;
pub const PRIMARY_PROC_BASED_VM_EXEC_CONTROLS: u32 = 0x4002;
pub const EXCEPTION_BITMAP: u32 = 0x4004;
pub const VM_EXIT_CONTROLS: u32 = 0x4010;
pub const VM_ENTRY_CONTROLS: u32 = 0x4014;
pub const VM_ENTRY_INTERRUPTION_INFO: u32 = 0x4018;
pub const VM_ENTRY_EXCEPTION_ERROR_CODE: u32 = 0x401A;
pub const SECONDARY_PROC_BASED_VM_EXEC_CONTROLS: u32 = 0x401E;

/* 32-bit read-only data fields. */
pub const VM_EXIT_REASON: u32 = 0x4402;
pub const VM_EXIT_INTERRUPTION_INFO: u32 = 0x4404;
pub const VM_EXIT_INSTRUCTION_LENGTH: u32 = 0x440C;

/* 32-bit guest state. */
pub const GUEST_ES_LIMIT: u32 = 0x4800;
pub const GUEST_CS_LIMIT: u32 = 0x4802;
pub const GUEST_SS_LIMIT: u32 = 0x4804;
pub const GUEST_DS_LIMIT: u32 = 0x4806;
pub const GUEST_FS_LIMIT: u32 = 0x4808;
pub const GUEST_GS_LIMIT: u32 = 0x480A;
pub const GUEST_LDTR_LIMIT: u32 = 0x480C;
pub const GUEST_TR_LIMIT: u32 = 0x480E;
pub const GUEST_GDTR_LIMIT: u32 = 0x4810;
pub const GUEST_IDTR_LIMIT: u32 = 0x4812;
pub const GUEST_ES_ACCESS_RIGHTS: u32 = 0x4814;
pub const GUEST_CS_ACCESS_RIGHTS: u32 = 0x4816;
pub const GUEST_SS_ACCESS_RIGHTS: u32 = 0x4818;
pub const GUEST_DS_ACCESS_RIGHTS: u32 = 0x481A;
pub const GUEST_FS_ACCESS_RIGHTS: u32 = 0x481C;
pub const GUEST_GS_ACCESS_RIGHTS: u32 = 0x481E;
pub const GUEST_LDTR_ACCESS_RIGHTS: u32 = 0x4820;
pub const GUEST_TR_ACCESS_RIGHTS: u32 = 0x4822;
pub const GUEST_INTERRUPTIBILITY_STATE: u32 = 0x4824;
pub const GUEST_ACTIVITY_STATE: u32 = 0x4826;

/* Natural-width fields. */
pub const EXIT_QUALIFICATION: u32 = 0x6400;
pub const GUEST_CR0: u32 = 0x6800;
pub const GUEST_CR3: u32 = 0x6802;
pub const GUEST_CR4: u32 = 0x6804;
pub const GUEST_ES_BASE: u32 = 0x6806;
pub const GUEST_CS_BASE: u32 = 0x6808;
pub const GUEST_SS_BASE: u32 = 0x680A;
pub const GUEST_DS_BASE: u32 = 0x680C;
pub const GUEST_FS_BASE: u32 = 0x680E;
pub const GUEST_GS_BASE: u32 = 0x6810;
pub const GUEST_LDTR_BASE: u32 = 0x6812;
pub const GUEST_TR_BASE: u32 = 0x6814;
pub const GUEST_GDTR_BASE: u32 = 0x6816;
pub const GUEST_IDTR_BASE: u32 = 0x6818;
pub const GUEST_RSP: u32 = 0x681C;
pub const GUEST_RIP: u32 = 0x681E;
pub const GUEST_RFLAGS: u32 = 0x6820;
pub const HOST_RSP: u32 = 0x6C14;
pub const HOST_RIP: u32 = 0x6C16;

/* Pin-based controls. */
pub const PIN_EXTINT_EXITING: u32 = 1 << 0;
pub const PIN_NMI_EXITING: u32 = 1 << 3;

/* Primary processor-based controls. */
pub const PROC_INTR_WINDOW_EXITING: u32 = 1 << 2;
pub const PROC_HLT_EXITING: u32 = 1 << 7;
pub const PROC_INVLPG_EXITING: u32 = 1 << 9;
pub const PROC_RDTSC_EXITING: u32 = 1 << 12;
pub const PROC_USE_IO_BITMAPS: u32 = 1 << 25;
pub const PROC_USE_MSR_BITMAPS: u32 = 1 << 28;
pub const PROC_SECONDARY_CTLS: u32 = 1 << 31;

/* Secondary processor-based controls. */
pub const PROC2_ENABLE_EPT: u32 = 1 << 1;
pub const PROC2_UNRESTRICTED_GUEST: u32 = 1 << 7;

/* Interruptibility state. */
pub const INTR_STATE_STI_BLOCKING: u32 = 1 << 0;
pub const INTR_STATE_MOV_SS_BLOCKING: u32 = 1 << 1;

/* VM-entry interruption info. */
pub const ENTRY_INTR_INFO_VALID: u32 = 1 << 31;
pub const ENTRY_INTR_TYPE_EXTINT: u32 = 0 << 8;
pub const ENTRY_INTR_TYPE_NMI: u32 = 2 << 8;
pub const ENTRY_INTR_TYPE_HW_EXCEPTION: u32 = 3 << 8;
pub const ENTRY_INTR_TYPE_SW_INT: u32 = 4 << 8;
pub const ENTRY_INTR_DELIVER_ERRCODE: u32 = 1 << 11;

/* Basic exit reasons. */
pub const EXIT_REASON_EXCEPTION_NMI: u32 = 0;
pub const EXIT_REASON_EXTERNAL_INTERRUPT: u32 = 1;
pub const EXIT_REASON_TRIPLE_FAULT: u32 = 2;
pub const EXIT_REASON_INTERRUPT_WINDOW: u32 = 7;
pub const EXIT_REASON_CPUID: u32 = 10;
pub const EXIT_REASON_HLT: u32 = 12;
pub const EXIT_REASON_INVLPG: u32 = 14;
pub const EXIT_REASON_RDTSC: u32 = 16;
pub const EXIT_REASON_VMCALL: u32 = 18;
pub const EXIT_REASON_VMCLEAR: u32 = 19;
pub const EXIT_REASON_VMLAUNCH: u32 = 20;
pub const EXIT_REASON_VMPTRLD: u32 = 21;
pub const EXIT_REASON_VMPTRST: u32 = 22;
pub const EXIT_REASON_VMREAD: u32 = 23;
pub const EXIT_REASON_VMRESUME: u32 = 24;
pub const EXIT_REASON_VMWRITE: u32 = 25;
pub const EXIT_REASON_VMXOFF: u32 = 26;
pub const EXIT_REASON_VMXON: u32 = 27;
pub const EXIT_REASON_IO_INSTRUCTION: u32 = 30;
pub const EXIT_REASON_RDMSR: u32 = 31;
pub const EXIT_REASON_WRMSR: u32 = 32;
pub const EXIT_REASON_EPT_VIOLATION: u32 = 48;
pub const EXIT_REASON_EPT_MISCONFIG: u32 = 49;
pub const EXIT_REASON_RDTSCP: u32 = 51;

/// Decoded I/O-instruction exit qualification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoQual {
    pub port: u16,
    pub input: bool,
    pub str_op: bool,
    pub rep: bool,
    pub sz: super::super::DataSz,
}

/// Pick apart an I/O exit's qualification word.
pub fn decode_io_qualification(qual: u64) -> Option<IoQual> {
    use super::super::DataSz;

    let sz = match qual & 0x7 {
        0 => DataSz::Sz8,
        1 => DataSz::Sz16,
        3 => DataSz::Sz32,
        _ => return None,
    };
    Some(IoQual {
        port: ((qual >> 16) & 0xFFFF) as u16,
        input: qual & (1 << 3) != 0,
        str_op: qual & (1 << 4) != 0,
        rep: qual & (1 << 5) != 0,
        sz,
    })
}

#[cfg(test)]
mod tests {
    use super::super::super::DataSz;
    use super::*;

    #[test]
    fn io_qualification_decodes_the_s4_access() {
        // in al, 0x71: 1-byte IN from port 0x71.
        let q = decode_io_qualification((0x71 << 16) | (1 << 3)).unwrap();
        assert_eq!(q.port, 0x71);
        assert!(q.input);
        assert_eq!(q.sz, DataSz::Sz8);

        // rep outsw to 0x3F8.
        let q = decode_io_qualification((0x3F8 << 16) | (1 << 5) | (1 << 4) | 1).unwrap();
        assert!(!q.input);
        assert!(q.rep && q.str_op);
        assert_eq!(q.sz, DataSz::Sz16);
    }

    #[test]
    fn reserved_size_encodings_fail() {
        assert!(decode_io_qualification(2).is_none());
    }

    #[test]
    fn field_numbers_follow_the_width_prefix_convention() {
        // 0x0xxx 16-bit, 0x2xxx 64-bit, 0x4xxx 32-bit, 0x6xxx natural.
        assert_eq!(GUEST_CS_SELECTOR >> 12, 0);
        assert_eq!(EPT_POINTER >> 12, 2);
        assert_eq!(VM_EXIT_REASON >> 12, 4);
        assert_eq!(GUEST_RIP >> 12, 6);
    }
}
