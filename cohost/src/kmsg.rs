//! Guest kernel message ring.
//!
//! The guest publishes the ring's physical address in the boot parameter
//! block once its console is up. Reader and writer share a lock word taken
//! with compare-and-swap; the host only ever holds it for one copy.

use crate::host::PhysMemory;
use crate::instance::OsInstance;
use cohost_shared::errors::{CohostError, CohostResult};
use cohost_shared::layout::{boot_params, kmsg, KmsgHeader};
use zerocopy::{FromZeros, IntoBytes};

const LOCK_ATTEMPTS: u32 = 1000;

/// Reader for one ring at a fixed physical address.
pub struct KmsgRing<'a> {
    memory: &'a dyn PhysMemory,
    base: u64,
}

impl<'a> KmsgRing<'a> {
    pub fn new(memory: &'a dyn PhysMemory, base: u64) -> Self {
        Self { memory, base }
    }

    /// Copy out everything between head and tail. With `consume` the head is
    /// advanced to the tail so the next read starts empty.
    pub fn read(&self, consume: bool) -> CohostResult<String> {
        self.lock()?;
        let result = self.read_locked(consume);
        let unlock = self.memory.write_u32(self.base + kmsg::LOCK, 0);
        let bytes = result?;
        unlock?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn lock(&self) -> CohostResult<()> {
        for _ in 0..LOCK_ATTEMPTS {
            if self.memory.compare_exchange_u32(self.base + kmsg::LOCK, 0, 1)? {
                return Ok(());
            }
            std::hint::spin_loop();
        }
        Err(CohostError::Busy(format!(
            "kmsg ring at {:#x} is held by the guest",
            self.base
        )))
    }

    fn read_locked(&self, consume: bool) -> CohostResult<Vec<u8>> {
        let mut header = KmsgHeader::new_zeroed();
        self.memory.read(self.base, header.as_mut_bytes())?;
        let KmsgHeader { head, tail, len, .. } = header;
        if len == 0 || len > kmsg::MAX_LEN || head >= len || tail >= len {
            return Err(CohostError::HardwareProtocol(format!(
                "kmsg ring at {:#x} is corrupt: len={} head={} tail={}",
                self.base, len, head, tail
            )));
        }

        let data = self.base + kmsg::DATA;
        let mut out;
        if head <= tail {
            out = vec![0u8; (tail - head) as usize];
            self.memory.read(data + head as u64, &mut out)?;
        } else {
            let first = (len - head) as usize;
            out = vec![0u8; first + tail as usize];
            let (a, b) = out.split_at_mut(first);
            self.memory.read(data + head as u64, a)?;
            self.memory.read(data, b)?;
        }

        if consume {
            self.memory.write_u32(self.base + kmsg::HEAD, tail)?;
        }
        Ok(out)
    }
}

impl OsInstance {
    /// Read the guest's kernel messages.
    ///
    /// Fails with `Validation` until the guest has published its ring.
    pub fn kmsg(&self, consume: bool) -> CohostResult<String> {
        let params = self.boot_params_phys().ok_or_else(|| {
            CohostError::Validation(format!("os {} has no image loaded", self.id()))
        })?;
        if !self.status().is_booted() {
            return Err(CohostError::Validation(format!(
                "os {} is {}",
                self.id(),
                self.status()
            )));
        }
        let memory = self.memory();
        let ring = memory.read_u64(params + boot_params::MSG_BUFFER)?;
        if ring == 0 {
            return Err(CohostError::Validation(format!(
                "os {} has not published a message buffer",
                self.id()
            )));
        }
        KmsgRing::new(memory.as_ref(), ring).read(consume)
    }
}
