//! End-to-end exercise of the virtual-device protocol over real
//! channels: a "guest" driven by the scripted vendor backend performs
//! port I/O against an emulated NVRAM-style device running on its own
//! thread, ending with an IRQ assertion delivered through the virtual
//! PIC.

use std::sync::mpsc;

use cinnabar_kernel::hvm::{
    self,
    mock::{pool_gate, MockVm},
    vdev::{IoportMsg, VDEV_GUEST_IOPORT_DATA, VDEV_MSG_LEN, VDEV_READ_IOPORT, VDEV_WRITE_IOPORT},
    vpic::IrqMode,
    CacheType, DataSz, ExitInfo, ExitReason, GuestEvent, IoportExit,
};
use cinnabar_kernel::{ipc, mm, proc};

fn io_exit(port: u16, width: DataSz, write: bool) -> (ExitReason, ExitInfo) {
    (
        ExitReason::Ioport,
        ExitInfo::Ioport(IoportExit {
            port,
            width,
            write,
            rep: false,
            str_op: false,
        }),
    )
}

#[test]
fn guest_talks_to_a_user_mode_device_end_to_end() {
    let _g = pool_gate();
    let pool = mm::testutil::init_global();
    let kernel = mm::kernel_pmap();

    let owner = proc::proc_new(pool, kernel, 1).unwrap();
    let dev_pid = proc::proc_new(pool, kernel, 2).unwrap();

    // The guest: select NVRAM register 0x32 (century byte), read it
    // back, then shut down.
    let script = vec![
        io_exit(0x70, DataSz::Sz8, true),
        io_exit(0x71, DataSz::Sz8, false),
    ];
    let mock = MockVm::new(script, false);
    let handle = mock.clone();
    mock.0.lock().regs.insert(0, 0x32); // EAX low byte: register select

    let vmid = hvm::create_vm_with(owner, Box::new(mock)).unwrap();
    let req_ch = ipc::alloc(Some(owner), Some(dev_pid), 64).unwrap();
    let sync_ch = ipc::alloc(Some(owner), Some(dev_pid), 64).unwrap();
    let vid = hvm::register_device(vmid, dev_pid, req_ch, sync_ch).unwrap();
    for port in [0x70u16, 0x71] {
        hvm::with_vdev(vmid, |vd| vd.register_ioport(port, DataSz::Sz8, vid))
            .unwrap()
            .unwrap();
    }
    hvm::with_vdev(vmid, |vd| vd.register_irq(8, vid))
        .unwrap()
        .unwrap();

    let (tx, rx) = mpsc::channel();

    // The device process: a two-register NVRAM fragment.
    let device = std::thread::spawn(move || {
        let mut selected = 0u8;
        let mut served = Vec::new();
        loop {
            let mut buf = [0u8; VDEV_MSG_LEN];
            let n = match ipc::recv(req_ch, Some(dev_pid), &mut buf, true) {
                Ok(n) => n,
                Err(_) => break,
            };
            let req = IoportMsg::decode(&buf[..n]).unwrap();
            served.push((req.magic, req.port));
            match req.magic {
                VDEV_WRITE_IOPORT => {
                    assert_eq!(req.port, 0x70);
                    selected = req.val as u8;
                }
                VDEV_READ_IOPORT => {
                    assert_eq!(req.port, 0x71);
                    let val = if selected == 0x32 { 0x20u32 } else { 0xFF };
                    let reply = IoportMsg {
                        magic: VDEV_GUEST_IOPORT_DATA,
                        port: req.port,
                        width: req.width,
                        val,
                    };
                    ipc::send(req_ch, Some(dev_pid), &reply.encode(), true).unwrap();
                    break;
                }
                other => panic!("unexpected request {other:#x}"),
            }
        }
        tx.send(served).unwrap();
    });

    // Script exhausted => shutdown, which surfaces as an exit fault.
    assert!(hvm::run_vm(pool, vmid, owner).is_err());
    device.join().unwrap();

    let served = rx.recv().unwrap();
    assert_eq!(
        served,
        vec![(VDEV_WRITE_IOPORT, 0x70), (VDEV_READ_IOPORT, 0x71)]
    );

    // The century byte landed in the low byte of guest EAX.
    let eax = handle.0.lock().regs.get(&0).copied().unwrap();
    assert_eq!(eax & 0xFF, 0x20);

    // The device asserts its IRQ; with guest IF set the next run
    // injects vector 0x28 (slave base + line 0).
    hvm::set_irq(vmid, vid, 8, IrqMode::Raise).unwrap();
    handle.0.lock().intr_enabled = true;
    handle.0.lock().pending = false;
    assert!(hvm::run_vm(pool, vmid, owner).is_err());
    assert!(handle
        .0
        .lock()
        .injected
        .contains(&(GuestEvent::ExtIntr, 0x28)));

    hvm::destroy_vm(vmid).unwrap();
    proc::proc_destroy(pool, owner);
    proc::proc_destroy(pool, dev_pid);
}

#[test]
fn guest_ram_is_shared_with_devices_through_copies() {
    let _g = pool_gate();
    let pool = mm::testutil::init_global();
    let kernel = mm::kernel_pmap();
    let owner = proc::proc_new(pool, kernel, 1).unwrap();

    let mock = MockVm::new(vec![], false);
    let vmid = hvm::create_vm_with(owner, Box::new(mock)).unwrap();

    // Back two pages of guest physical memory.
    for gpa in [0x1000u32, 0x2000] {
        let f = pool.alloc_page().unwrap();
        pool.incref(f);
        pool.zero_frame(f);
        hvm::set_mmap(vmid, gpa, f.addr().as_u32(), CacheType::WriteBack).unwrap();
    }

    // A device-side buffer crossing a page boundary in its own space.
    let space = mm::AddrSpace::new_user(pool, kernel).unwrap();
    let la = 0x6000_0F80u32;
    space
        .reserve(pool, 0x6000_0000, mm::PteFlags::W | mm::PteFlags::U)
        .unwrap();
    space
        .reserve(pool, 0x6000_1000, mm::PteFlags::W | mm::PteFlags::U)
        .unwrap();
    space.memset(pool, la, 0x77, 0x100);

    // Into the guest across its own page boundary, and back out.
    hvm::copy_guest(pool, vmid, 0x1F80, space.pmap(), la, 0x100, true).unwrap();
    let back_la = 0x6000_1200u32;
    hvm::copy_guest(pool, vmid, 0x1F80, space.pmap(), back_la, 0x100, false).unwrap();

    let mut buf = [0u8; 0x100];
    use cinnabar_kernel::proc::elf::ImageSource;
    let img = cinnabar_kernel::proc::elf::UserImage::new(pool, space.pmap(), back_la, 0x100).unwrap();
    img.read_at(0, &mut buf).unwrap();
    assert_eq!(buf, [0x77; 0x100]);

    space.destroy(pool);
    hvm::destroy_vm(vmid).unwrap();
    proc::proc_destroy(pool, owner);
}
