//! VMM run-loop and facade tests, driven by the scripted backend.
//!
//! The VM pool is a process-wide singleton, so every test serializes on
//! one lock, creates its VM, and vacates the slot before releasing it.

use alloc::boxed::Box;
use alloc::vec;

use super::mock::{pool_gate as gate, MockVm};
use super::vdev::{IoportMsg, VDEV_GUEST_IOPORT_DATA, VDEV_MSG_LEN, VDEV_READ_IOPORT};
use super::*;
use crate::{
    config::MAX_VMID,
    error::HvmError,
    ipc,
    mm::{testutil, PhysPool},
    proc::{proc_destroy, proc_new, Pid},
};

fn procs(pool: &'static PhysPool, n: usize) -> alloc::vec::Vec<Pid> {
    let kernel = crate::mm::Pmap::new_kernel(pool).unwrap();
    (0..n).map(|_| proc_new(pool, &kernel, 1).unwrap()).collect()
}

#[test]
fn facade_rejects_vacant_slots() {
    let _g = gate();
    assert_eq!(get_reg(0, GuestReg::Eax), Err(HvmError::NoSlot));
    assert_eq!(guest_mem_size(0), Err(HvmError::NoSlot));
    assert_eq!(set_mmap(0, 0, 0, CacheType::WriteBack), Err(HvmError::NoSlot));
    assert_eq!(get_reg(MAX_VMID + 3, GuestReg::Eax), Err(HvmError::NoSlot));
}

#[test]
fn vm_lifecycle_and_owner_checks() {
    let _g = gate();
    let pool = testutil::pool(96);
    let pids = procs(pool, 2);
    let (owner, stranger) = (pids[0], pids[1]);

    let mock = MockVm::new(vec![], false);
    let vmid = create_vm_with(owner, Box::new(mock)).unwrap();
    assert_eq!(owner_of(vmid).unwrap(), owner);
    assert_eq!(guest_mem_size(vmid).unwrap(), crate::config::GUEST_PHY_MEMORY_SIZE);

    // Only the owner may run it.
    assert_eq!(run_vm(pool, vmid, stranger), Err(HvmError::NotOwner));

    // An exhausted script is a shutdown, which stops the VM.
    assert_eq!(run_vm(pool, vmid, owner), Err(HvmError::ExitFault));
    assert_eq!(last_exit(vmid).unwrap().0, ExitReason::Shutdown);

    destroy_vm(vmid).unwrap();
    assert_eq!(owner_of(vmid), Err(HvmError::NoSlot));
    for p in pids {
        proc_destroy(pool, p);
    }
}

/// Scenario: the guest executes `in al, 0x71`; the owning device
/// receives READ_IOPORT {port 0x71, SZ8}, replies IOPORT_DATA with
/// 0x42, and the monitor lands 0x42 in the low byte of guest EAX
/// before resuming.
#[test]
fn guest_port_read_round_trips_through_the_device() {
    let _g = gate();
    let pool = testutil::pool(96);
    let pids = procs(pool, 2);
    let (owner, dev_pid) = (pids[0], pids[1]);

    let io_exit = ExitInfo::Ioport(IoportExit {
        port: 0x71,
        width: DataSz::Sz8,
        write: false,
        rep: false,
        str_op: false,
    });
    let mock = MockVm::new(vec![(ExitReason::Ioport, io_exit)], false);
    let handle = mock.clone();
    // Guest EAX holds unrelated high bytes that must survive.
    mock.0.lock().regs.insert(0, 0xAABB_CC00);

    let vmid = create_vm_with(owner, Box::new(mock)).unwrap();
    let req_ch = ipc::alloc(Some(owner), Some(dev_pid), 64).unwrap();
    let sync_ch = ipc::alloc(Some(owner), Some(dev_pid), 64).unwrap();
    let vid = register_device(vmid, dev_pid, req_ch, sync_ch).unwrap();
    with_vdev(vmid, |vd| vd.register_ioport(0x71, DataSz::Sz8, vid))
        .unwrap()
        .unwrap();

    // The device side: pick up the request, answer 0x42.
    let device = std::thread::spawn(move || {
        let mut buf = [0u8; VDEV_MSG_LEN];
        let n = ipc::recv(req_ch, Some(dev_pid), &mut buf, true).unwrap();
        let req = IoportMsg::decode(&buf[..n]).unwrap();
        assert_eq!(req.magic, VDEV_READ_IOPORT);
        assert_eq!(req.port, 0x71);
        assert_eq!(req.width, DataSz::Sz8);
        assert_eq!(req.val, 0);

        let reply = IoportMsg {
            magic: VDEV_GUEST_IOPORT_DATA,
            port: 0x71,
            width: DataSz::Sz8,
            val: 0x42,
        };
        ipc::send(req_ch, Some(dev_pid), &reply.encode(), true).unwrap();
    });

    // Script: one port exit, then shutdown ends the loop.
    assert_eq!(run_vm(pool, vmid, owner), Err(HvmError::ExitFault));
    device.join().unwrap();

    let st = handle.0.lock();
    assert_eq!(
        st.regs.get(&0).copied().unwrap(),
        0xAABB_CC42,
        "reply merged into the low byte of EAX"
    );
    assert_eq!(
        st.regs.get(&8).copied().unwrap(),
        0x7C02,
        "EIP advanced past the in instruction"
    );
    drop(st);

    destroy_vm(vmid).unwrap();
    for p in pids {
        proc_destroy(pool, p);
    }
}

#[test]
fn unowned_port_reads_float_high_and_writes_vanish() {
    let _g = gate();
    let pool = testutil::pool(96);
    let pids = procs(pool, 1);
    let owner = pids[0];

    let read_exit = ExitInfo::Ioport(IoportExit {
        port: 0x300,
        width: DataSz::Sz16,
        write: false,
        rep: false,
        str_op: false,
    });
    let write_exit = ExitInfo::Ioport(IoportExit {
        port: 0x301,
        width: DataSz::Sz8,
        write: true,
        rep: false,
        str_op: false,
    });
    let mock = MockVm::new(
        vec![
            (ExitReason::Ioport, read_exit),
            (ExitReason::Ioport, write_exit),
        ],
        false,
    );
    let handle = mock.clone();
    let vmid = create_vm_with(owner, Box::new(mock)).unwrap();

    assert_eq!(run_vm(pool, vmid, owner), Err(HvmError::ExitFault));
    let st = handle.0.lock();
    assert_eq!(st.regs.get(&0).copied().unwrap() & 0xFFFF, 0xFFFF);
    drop(st);

    destroy_vm(vmid).unwrap();
    proc_destroy(pool, owner);
}

/// Scenario: a device owning IRQ 4 asserts it; the virtual PIC records
/// it; on the next entry with IF set and no shadow, vector 0x24 is
/// injected as an external interrupt.
#[test]
fn asserted_irq_is_injected_once_deliverable() {
    let _g = gate();
    let pool = testutil::pool(96);
    let pids = procs(pool, 2);
    let (owner, dev_pid) = (pids[0], pids[1]);

    let mock = MockVm::new(vec![], true); // guest IF set, no shadow
    let handle = mock.clone();
    let vmid = create_vm_with(owner, Box::new(mock)).unwrap();

    let req_ch = ipc::alloc(Some(owner), Some(dev_pid), 64).unwrap();
    let sync_ch = ipc::alloc(Some(owner), Some(dev_pid), 64).unwrap();
    let vid = register_device(vmid, dev_pid, req_ch, sync_ch).unwrap();
    with_vdev(vmid, |vd| vd.register_irq(4, vid)).unwrap().unwrap();

    // A foreign vid may not drive the line.
    assert_eq!(
        set_irq(vmid, vid + 1, 4, vpic::IrqMode::Raise),
        Err(HvmError::NotOwner)
    );
    set_irq(vmid, vid, 4, vpic::IrqMode::Raise).unwrap();

    assert_eq!(run_vm(pool, vmid, owner), Err(HvmError::ExitFault));
    let st = handle.0.lock();
    assert_eq!(st.injected.as_slice(), &[(GuestEvent::ExtIntr, 0x24)]);
    drop(st);

    destroy_vm(vmid).unwrap();
    for p in pids {
        proc_destroy(pool, p);
    }
}

#[test]
fn undeliverable_irq_arms_the_interrupt_window() {
    let _g = gate();
    let pool = testutil::pool(96);
    let pids = procs(pool, 2);
    let (owner, dev_pid) = (pids[0], pids[1]);

    // IF clear: nothing may be injected yet.
    let mock = MockVm::new(vec![], false);
    let handle = mock.clone();
    let vmid = create_vm_with(owner, Box::new(mock)).unwrap();
    let req_ch = ipc::alloc(Some(owner), Some(dev_pid), 64).unwrap();
    let sync_ch = ipc::alloc(Some(owner), Some(dev_pid), 64).unwrap();
    let vid = register_device(vmid, dev_pid, req_ch, sync_ch).unwrap();
    with_vdev(vmid, |vd| vd.register_irq(4, vid)).unwrap().unwrap();
    set_irq(vmid, vid, 4, vpic::IrqMode::Raise).unwrap();

    assert_eq!(run_vm(pool, vmid, owner), Err(HvmError::ExitFault));
    let st = handle.0.lock();
    assert!(st.injected.is_empty());
    assert!(st.intr_window_armed, "window exit requested instead");
    drop(st);

    destroy_vm(vmid).unwrap();
    for p in pids {
        proc_destroy(pool, p);
    }
}

#[test]
fn nested_fault_below_memsize_maps_ram_lazily() {
    let _g = gate();
    let pool = testutil::pool(96);
    let pids = procs(pool, 1);
    let owner = pids[0];

    let mock = MockVm::new(
        vec![(ExitReason::PageFault, ExitInfo::PageFault { gpa: 0x0010_0234 })],
        false,
    );
    let handle = mock.clone();
    let vmid = create_vm_with(owner, Box::new(mock)).unwrap();

    assert_eq!(run_vm(pool, vmid, owner), Err(HvmError::ExitFault));
    let st = handle.0.lock();
    let hpa = st.mappings.get(&0x0010_0000).copied().expect("page mapped");
    assert_eq!(hpa % crate::mm::PAGE_SIZE as u32, 0);
    drop(st);

    destroy_vm(vmid).unwrap();
    proc_destroy(pool, owner);
}

#[test]
fn nested_fault_beyond_memsize_stops_the_vm() {
    let _g = gate();
    let pool = testutil::pool(96);
    let pids = procs(pool, 1);
    let owner = pids[0];

    let gpa = crate::config::GUEST_PHY_MEMORY_SIZE + 0x1000;
    let mock = MockVm::new(
        vec![(ExitReason::PageFault, ExitInfo::PageFault { gpa })],
        false,
    );
    let vmid = create_vm_with(owner, Box::new(mock)).unwrap();
    assert_eq!(run_vm(pool, vmid, owner), Err(HvmError::ExitFault));
    assert_eq!(last_exit(vmid).unwrap().0, ExitReason::PageFault);

    destroy_vm(vmid).unwrap();
    proc_destroy(pool, owner);
}

#[test]
fn cpuid_exits_are_emulated_inline_and_advance() {
    let _g = gate();
    let pool = testutil::pool(96);
    let pids = procs(pool, 1);
    let owner = pids[0];

    let mock = MockVm::new(vec![(ExitReason::Cpuid, ExitInfo::None)], false);
    let handle = mock.clone();
    let vmid = create_vm_with(owner, Box::new(mock)).unwrap();
    assert_eq!(run_vm(pool, vmid, owner), Err(HvmError::ExitFault));
    let st = handle.0.lock();
    assert_eq!(st.regs.get(&8).copied().unwrap(), 0x7C02, "EIP advanced");
    drop(st);

    destroy_vm(vmid).unwrap();
    proc_destroy(pool, owner);
}

#[test]
fn guest_memory_copies_resolve_through_the_nested_table() {
    let _g = gate();
    let pool = testutil::pool(96);
    let kernel = crate::mm::Pmap::new_kernel(pool).unwrap();
    let pids = procs(pool, 1);
    let owner = pids[0];

    let mock = MockVm::new(vec![], false);
    let vmid = create_vm_with(owner, Box::new(mock)).unwrap();

    // One page of "guest RAM".
    let guest_frame = pool.alloc_page().unwrap();
    pool.incref(guest_frame);
    pool.zero_frame(guest_frame);
    set_mmap(vmid, 0x8000, guest_frame.addr().as_u32(), CacheType::WriteBack).unwrap();

    // Device-side buffer in a user space.
    let space = crate::mm::AddrSpace::new_user(pool, &kernel).unwrap();
    let la = 0x5000_0000u32;
    space
        .reserve(pool, la, crate::mm::PteFlags::W | crate::mm::PteFlags::U)
        .unwrap();
    space.memset(pool, la, 0x5C, 24);

    copy_guest(pool, vmid, 0x8010, space.pmap(), la, 24, true).unwrap();
    // SAFETY: Arena-backed frame.
    unsafe {
        assert_eq!(*pool.frame_ptr(guest_frame).add(0x10), 0x5C);
        assert_eq!(*pool.frame_ptr(guest_frame).add(0x10 + 23), 0x5C);
    }

    // And back out of the guest.
    let back = la + 0x800;
    space
        .reserve(pool, back, crate::mm::PteFlags::W | crate::mm::PteFlags::U)
        .ok();
    copy_guest(pool, vmid, 0x8010, space.pmap(), back, 24, false).unwrap();
    let pte = space.pmap().lookup(pool, back).unwrap();
    // SAFETY: Arena-backed frame.
    unsafe {
        let p = pool.frame_ptr(crate::mm::FrameNumber::new(pte >> 12));
        assert_eq!(*p.add(crate::mm::page_off(back) as usize), 0x5C);
    }

    // Unmapped guest pages refuse the copy.
    assert_eq!(
        copy_guest(pool, vmid, 0x0070_0000, space.pmap(), la, 8, false),
        Err(HvmError::BadArg)
    );

    space.destroy(pool);
    destroy_vm(vmid).unwrap();
    for p in pids {
        proc_destroy(pool, p);
    }
}

#[test]
fn device_ready_barrier_waits_for_every_device() {
    let _g = gate();
    let pool = testutil::pool(96);
    let pids = procs(pool, 3);
    let (owner, dev_a, dev_b) = (pids[0], pids[1], pids[2]);

    let mock = MockVm::new(vec![], false);
    let vmid = create_vm_with(owner, Box::new(mock)).unwrap();
    let mut sync_chans = alloc::vec::Vec::new();
    for dev in [dev_a, dev_b] {
        let req = ipc::alloc(Some(owner), Some(dev), 64).unwrap();
        let sync = ipc::alloc(Some(owner), Some(dev), 64).unwrap();
        register_device(vmid, dev, req, sync).unwrap();
        sync_chans.push((dev, sync));
    }

    // Devices report ready from their own threads.
    let reporters: alloc::vec::Vec<_> = sync_chans
        .iter()
        .map(|&(dev, sync)| {
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(10));
                ipc::send(sync, Some(dev), &vdev::encode_magic(vdev::VDEV_DEVICE_READY), true)
                    .unwrap();
            })
        })
        .collect();

    vdev::wait_all_devices_ready(vmid, owner).unwrap();
    assert!(with_vdev(vmid, |vd| vd.all_ready()).unwrap());
    for r in reporters {
        r.join().unwrap();
    }

    destroy_vm(vmid).unwrap();
    for p in pids {
        proc_destroy(pool, p);
    }
}

#[test]
fn device_sync_round_trips_before_the_guest_proceeds() {
    let _g = gate();
    let pool = testutil::pool(96);
    let pids = procs(pool, 2);
    let (owner, dev) = (pids[0], pids[1]);

    let mock = MockVm::new(vec![], false);
    let vmid = create_vm_with(owner, Box::new(mock)).unwrap();
    let req = ipc::alloc(Some(owner), Some(dev), 64).unwrap();
    let sync = ipc::alloc(Some(owner), Some(dev), 64).unwrap();
    register_device(vmid, dev, req, sync).unwrap();

    let device = std::thread::spawn(move || {
        let mut buf = [0u8; VDEV_MSG_LEN];
        let n = ipc::recv(sync, Some(dev), &mut buf, true).unwrap();
        assert_eq!(vdev::peek_magic(&buf[..n]), Some(vdev::VDEV_DEVICE_SYNC));
        // Acknowledge after "synchronizing with the host device".
        ipc::send(sync, Some(dev), &vdev::encode_magic(vdev::VDEV_DEVICE_READY), true).unwrap();
    });

    vdev::sync_devices(vmid, owner).unwrap();
    device.join().unwrap();

    destroy_vm(vmid).unwrap();
    for p in pids {
        proc_destroy(pool, p);
    }
}
