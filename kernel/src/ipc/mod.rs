//! Synchronous IPC.
//!
//! Blocking and non-blocking send/receive over the one-slot channels in
//! `channel`. Blocking callers sleep on the channel's wait key with the
//! channel lock handed to the scheduler, so the unlock and the enqueue
//! are one step and a racing wake cannot slip between them. Messages
//! that cross the user/kernel boundary are byte-copied through the
//! sender's or receiver's page map; in-kernel callers skip the
//! crossing.

pub mod channel;

extern crate alloc;

use alloc::vec::Vec;

pub use channel::{alloc, capacity, free, ChannelId};

use crate::{
    error::IpcError,
    mm::{Pmap, PhysPool, VM_USERHI, VM_USERLO},
    proc::{sched, Pid},
};

/// Send `msg` on `id`. With `blocking`, a full slot puts the caller to
/// sleep until a receiver drains it; otherwise `Full` comes straight
/// back. A delivered message wakes sleepers on the channel.
pub fn send(
    id: ChannelId,
    sender: Option<Pid>,
    msg: &[u8],
    blocking: bool,
) -> Result<(), IpcError> {
    let lock = channel::slot(id)?;
    let mut ch = lock.lock();
    loop {
        match ch.try_send(sender, msg) {
            Err(IpcError::Full) if blocking => {
                let pid = sender.ok_or(IpcError::IllSender)?;
                sched::sleep(pid, channel::wchan(id), Some(ch));
                ch = lock.lock();
            }
            Err(e) => return Err(e),
            Ok(()) => break,
        }
    }
    drop(ch);
    sched::wake(channel::wchan(id));
    Ok(())
}

/// Receive from `id` into `buf`, returning the message length. With
/// `blocking`, an empty slot sleeps the caller until a sender fills it.
/// A drained slot wakes sleepers on the channel.
pub fn recv(
    id: ChannelId,
    receiver: Option<Pid>,
    buf: &mut [u8],
    blocking: bool,
) -> Result<usize, IpcError> {
    let lock = channel::slot(id)?;
    let mut ch = lock.lock();
    let n = loop {
        match ch.try_recv(receiver, buf) {
            Err(IpcError::Empty) if blocking => {
                let pid = receiver.ok_or(IpcError::IllReceiver)?;
                sched::sleep(pid, channel::wchan(id), Some(ch));
                ch = lock.lock();
            }
            Err(e) => return Err(e),
            Ok(n) => break n,
        }
    };
    drop(ch);
    sched::wake(channel::wchan(id));
    Ok(n)
}

/// Send from a user buffer: the range must sit in the user window and
/// fully resolve through `pmap`.
pub fn send_user(
    pool: &PhysPool,
    pmap: &Pmap,
    id: ChannelId,
    sender: Pid,
    va: u32,
    size: usize,
    blocking: bool,
) -> Result<(), IpcError> {
    if size == 0 {
        return Err(IpcError::BadArg);
    }
    let msg = copy_in(pool, pmap, va, size)?;
    send(id, Some(sender), &msg, blocking)
}

/// Receive into a user buffer; same addressing contract as `send_user`.
pub fn recv_user(
    pool: &PhysPool,
    pmap: &Pmap,
    id: ChannelId,
    receiver: Pid,
    va: u32,
    size: usize,
    blocking: bool,
) -> Result<usize, IpcError> {
    check_user_range(va, size)?;
    if !pmap.checkrange(pool, va, size as u32) {
        return Err(IpcError::BadArg);
    }
    let mut buf = alloc::vec![0u8; size];
    let n = recv(id, Some(receiver), &mut buf, blocking)?;
    let copied = copy_out(pool, pmap, va, &buf[..n]);
    if copied != n {
        return Err(IpcError::BadArg);
    }
    Ok(n)
}

fn check_user_range(va: u32, size: usize) -> Result<(), IpcError> {
    let end = va.checked_add(size as u32).ok_or(IpcError::BadArg)?;
    if va < VM_USERLO || end > VM_USERHI {
        return Err(IpcError::BadArg);
    }
    Ok(())
}

/// Copy a user range into a kernel vector.
fn copy_in(pool: &PhysPool, pmap: &Pmap, va: u32, size: usize) -> Result<Vec<u8>, IpcError> {
    check_user_range(va, size)?;
    if !pmap.checkrange(pool, va, size as u32) {
        return Err(IpcError::BadArg);
    }
    let mut out = alloc::vec![0u8; size];
    let mut done = 0usize;
    while done < size {
        let cur = va + done as u32;
        let pte = pmap.lookup(pool, cur).ok_or(IpcError::BadArg)?;
        let off = crate::mm::page_off(cur) as usize;
        let chunk = (size - done).min(crate::mm::PAGE_SIZE - off);
        // SAFETY: The PTE resolves into a pool frame; chunk stays
        // inside it.
        unsafe {
            let src = pool.frame_ptr(crate::mm::FrameNumber::new(pte >> 12)).add(off);
            core::ptr::copy_nonoverlapping(src, out[done..].as_mut_ptr(), chunk);
        }
        done += chunk;
    }
    Ok(out)
}

/// Copy kernel bytes out to a user range. Returns bytes written.
fn copy_out(pool: &PhysPool, pmap: &Pmap, va: u32, bytes: &[u8]) -> usize {
    let mut done = 0usize;
    while done < bytes.len() {
        let cur = va + done as u32;
        let Some(pte) = pmap.lookup(pool, cur) else {
            return done;
        };
        let off = crate::mm::page_off(cur) as usize;
        let chunk = (bytes.len() - done).min(crate::mm::PAGE_SIZE - off);
        // SAFETY: See copy_in.
        unsafe {
            let dst = pool.frame_ptr(crate::mm::FrameNumber::new(pte >> 12)).add(off);
            core::ptr::copy_nonoverlapping(bytes[done..].as_ptr(), dst, chunk);
        }
        done += chunk;
    }
    done
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mm::{testutil, AddrSpace, PteFlags, PAGE_SIZE},
        proc::{proc_destroy, proc_new, ProcState},
    };

    #[test]
    fn nonblocking_send_recv_round_trip() {
        let id = alloc(None, None, 64).unwrap();
        send(id, None, &[0xAA; 16], false).unwrap();
        let mut buf = [0u8; 32];
        let n = recv(id, None, &mut buf, false).unwrap();
        assert_eq!(n, 16);
        assert_eq!(&buf[..16], &[0xAA; 16]);
    }

    #[test]
    fn nonblocking_variants_fail_fast() {
        let id = alloc(None, None, 64).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(recv(id, None, &mut buf, false), Err(IpcError::Empty));
        send(id, None, &[1], false).unwrap();
        assert_eq!(send(id, None, &[2], false), Err(IpcError::Full));
    }

    /// Scenario: A blocks receiving on an empty channel; B sends
    /// sixteen 0x01 bytes; A wakes and observes them.
    #[test]
    fn blocking_recv_wakes_on_send() {
        let pool = testutil::pool(96);
        let kernel = crate::mm::Pmap::new_kernel(pool).unwrap();
        let a = proc_new(pool, &kernel, 2).unwrap();
        let b = proc_new(pool, &kernel, 2).unwrap();
        let id = alloc(Some(a), Some(b), 64).unwrap();

        // Blocking receive on the host degrades to a polling retry
        // loop, so drive it from a second thread while the sender runs
        // here.
        let recv_side = std::thread::spawn(move || {
            let mut buf = [0u8; 16];
            let n = recv(id, Some(a), &mut buf, true).unwrap();
            (n, buf)
        });

        std::thread::sleep(std::time::Duration::from_millis(20));
        send(id, Some(b), &[0x01; 16], false).unwrap();

        let (n, buf) = recv_side.join().unwrap();
        assert_eq!(n, 16);
        assert_eq!(buf, [0x01; 16]);

        proc_destroy(pool, a);
        proc_destroy(pool, b);
    }

    #[test]
    fn foreign_processes_cannot_use_an_owned_channel() {
        let pool = testutil::pool(96);
        let kernel = crate::mm::Pmap::new_kernel(pool).unwrap();
        let p1 = proc_new(pool, &kernel, 2).unwrap();
        let p2 = proc_new(pool, &kernel, 2).unwrap();
        let outsider = proc_new(pool, &kernel, 2).unwrap();
        let id = alloc(Some(p1), Some(p2), 64).unwrap();

        assert_eq!(
            send(id, Some(outsider), &[1], false),
            Err(IpcError::IllSender)
        );
        let mut buf = [0u8; 4];
        assert_eq!(
            recv(id, Some(outsider), &mut buf, false),
            Err(IpcError::IllReceiver)
        );

        proc_destroy(pool, p1);
        proc_destroy(pool, p2);
        proc_destroy(pool, outsider);
    }

    #[test]
    fn a_process_never_receives_its_own_message() {
        let pool = testutil::pool(96);
        let kernel = crate::mm::Pmap::new_kernel(pool).unwrap();
        let a = proc_new(pool, &kernel, 2).unwrap();
        let b = proc_new(pool, &kernel, 2).unwrap();
        let id = alloc(Some(a), Some(b), 64).unwrap();

        send(id, Some(a), &[7], false).unwrap();
        let mut buf = [0u8; 4];
        // The request sits in the slot, but not for its sender.
        assert_eq!(recv(id, Some(a), &mut buf, false), Err(IpcError::Empty));
        assert_eq!(recv(id, Some(b), &mut buf, false), Ok(1));
        assert_eq!(buf[0], 7);

        proc_destroy(pool, a);
        proc_destroy(pool, b);
    }

    #[test]
    fn dead_peers_surface_as_device_gone() {
        let pool = testutil::pool(96);
        let kernel = crate::mm::Pmap::new_kernel(pool).unwrap();
        let alive = proc_new(pool, &kernel, 2).unwrap();
        let doomed = proc_new(pool, &kernel, 2).unwrap();
        let id = alloc(Some(alive), Some(doomed), 64).unwrap();

        proc_destroy(pool, doomed);
        assert_eq!(send(id, Some(alive), &[1], false), Err(IpcError::DeviceGone));
        let mut buf = [0u8; 4];
        assert_eq!(
            recv(id, Some(alive), &mut buf, false),
            Err(IpcError::DeviceGone)
        );
        proc_destroy(pool, alive);
    }

    #[test]
    fn user_buffers_cross_through_the_page_map() {
        let pool = testutil::pool(96);
        let kernel = crate::mm::Pmap::new_kernel(pool).unwrap();
        let pid = proc_new(pool, &kernel, 2).unwrap();
        let space = AddrSpace::new_user(pool, &kernel).unwrap();
        let va = 0x5000_0000u32;
        space.reserve(pool, va, PteFlags::W | PteFlags::U).unwrap();
        space.memset(pool, va, 0x42, 32);

        let id = alloc(None, None, PAGE_SIZE).unwrap();
        send_user(pool, space.pmap(), id, pid, va, 32, false).unwrap();

        let dst_va = va + 0x100;
        let n = recv_user(pool, space.pmap(), id, pid, dst_va, 32, false).unwrap();
        assert_eq!(n, 32);
        let mut check = [0u8; 32];
        let img = crate::proc::elf::UserImage::new(pool, space.pmap(), dst_va, 32).unwrap();
        use crate::proc::elf::ImageSource;
        img.read_at(0, &mut check).unwrap();
        assert_eq!(check, [0x42; 32]);

        space.destroy(pool);
        proc_destroy(pool, pid);
    }

    #[test]
    fn kernel_ranges_are_rejected_for_user_crossings() {
        let pool = testutil::pool(96);
        let kernel = crate::mm::Pmap::new_kernel(pool).unwrap();
        let pid = proc_new(pool, &kernel, 2).unwrap();
        let id = alloc(None, None, 64).unwrap();
        assert_eq!(
            send_user(pool, &kernel, id, pid, 0x1000, 16, false),
            Err(IpcError::BadArg)
        );
        proc_destroy(pool, pid);
    }

    #[test]
    fn sleeping_sender_state_is_recorded() {
        let pool = testutil::pool(96);
        let kernel = crate::mm::Pmap::new_kernel(pool).unwrap();
        let p = proc_new(pool, &kernel, 2).unwrap();
        let id = alloc(Some(p), None, 64).unwrap();
        send(id, Some(p), &[9], false).unwrap();

        // A second blocking send from a thread must park the process
        // (host: poll loop) until this thread drains the slot.
        let sender = std::thread::spawn(move || send(id, Some(p), &[10], true));
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(matches!(
            crate::proc::state_of(p),
            Some(ProcState::Sleeping | ProcState::Ready | ProcState::Inited)
        ));
        let mut buf = [0u8; 4];
        recv(id, None, &mut buf, false).unwrap();
        sender.join().unwrap().unwrap();
        let n = recv(id, None, &mut buf, false).unwrap();
        assert_eq!(buf[..n], [10]);
        proc_destroy(pool, p);
    }
}
