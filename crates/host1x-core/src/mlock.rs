//! MLOCK arbitration: a small number of global hardware locks channels
//! use to serialize access to a shared engine.

use parking_lot::{Condvar, Mutex};

use crate::error::{Host1xError, Result};

/// Owns every MLOCK's owner-channel state for one device.
pub struct MlockRegistry {
    owners: Mutex<Vec<Option<u32>>>,
    free_cond: Condvar,
}

impl MlockRegistry {
    pub fn new(count: u32) -> Self {
        MlockRegistry {
            owners: Mutex::new(vec![None; count as usize]),
            free_cond: Condvar::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.owners.lock().len()
    }

    /// Non-blocking attempt. Returns `Busy` if another channel holds it.
    pub fn try_acquire(&self, index: u32, channel: u32) -> Result<()> {
        let mut owners = self.owners.lock();
        match owners[index as usize] {
            Some(owner) if owner == channel => Ok(()),
            Some(_) => Err(Host1xError::Busy(index as u64)),
            None => {
                owners[index as usize] = Some(channel);
                Ok(())
            }
        }
    }

    /// Block until `index` is free or already owned by `channel`, then
    /// take it. Corresponds to the `ACQUIRE_MLOCK` opcode executing on
    /// real hardware, which stalls the channel's fetch until the lock
    /// frees up.
    pub fn acquire(&self, index: u32, channel: u32) {
        let mut owners = self.owners.lock();
        loop {
            match owners[index as usize] {
                Some(owner) if owner == channel => return,
                None => {
                    owners[index as usize] = Some(channel);
                    return;
                }
                Some(_) => self.free_cond.wait(&mut owners),
            }
        }
    }

    pub fn release(&self, index: u32, channel: u32) {
        let mut owners = self.owners.lock();
        if owners[index as usize] == Some(channel) {
            owners[index as usize] = None;
            self.free_cond.notify_all();
        }
    }

    pub fn owner(&self, index: u32) -> Option<u32> {
        self.owners.lock()[index as usize]
    }

    /// Forcibly release every MLOCK `channel` holds, per the channel-hang
    /// recovery sequence step 6. Unconditional even if another channel is
    /// blocked in [`Self::acquire`] waiting on the same lock — this
    /// workspace has no prior behaviour to preserve here, and
    /// unconditional release matches the wording of the recovery step.
    pub fn release_all_for_channel(&self, channel: u32) -> Vec<u32> {
        let mut owners = self.owners.lock();
        let mut released = Vec::new();
        for (idx, owner) in owners.iter_mut().enumerate() {
            if *owner == Some(channel) {
                *owner = None;
                released.push(idx as u32);
            }
        }
        if !released.is_empty() {
            self.free_cond.notify_all();
        }
        released
    }

    pub fn snapshot(&self) -> Vec<Option<u32>> {
        self.owners.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_acquire_then_release_round_trips() {
        let reg = MlockRegistry::new(4);
        reg.try_acquire(0, 1).unwrap();
        assert_eq!(reg.owner(0), Some(1));
        reg.release(0, 1);
        assert_eq!(reg.owner(0), None);
    }

    #[test]
    fn try_acquire_fails_when_held_by_other_channel() {
        let reg = MlockRegistry::new(4);
        reg.try_acquire(0, 1).unwrap();
        let err = reg.try_acquire(0, 2).unwrap_err();
        assert_eq!(err, Host1xError::Busy(0));
    }

    #[test]
    fn reacquire_by_same_channel_is_idempotent() {
        let reg = MlockRegistry::new(4);
        reg.try_acquire(0, 1).unwrap();
        reg.try_acquire(0, 1).unwrap();
    }

    #[test]
    fn release_all_for_channel_only_touches_that_channels_locks() {
        let reg = MlockRegistry::new(4);
        reg.try_acquire(0, 1).unwrap();
        reg.try_acquire(1, 2).unwrap();
        let released = reg.release_all_for_channel(1);
        assert_eq!(released, vec![0]);
        assert_eq!(reg.owner(1), Some(2));
    }
}
