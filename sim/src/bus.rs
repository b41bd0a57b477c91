//! The part of the address space the simulated LDMA can reach: RAM handed
//! to it through [`Bus::map`] and nothing else. Peripheral registers are
//! answered by the controller itself.

use ldma_core::{descriptor::RawDescriptor, ChannelId};

pub const RAM_BASE: u32 = 0x2000_0000;

const ALIGN: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusFault {
    pub address: u32,
}

struct Region {
    channel: ChannelId,
    address: u32,
    ptr: *mut u32,
    words: usize,
}

impl Region {
    fn end(&self) -> u32 {
        self.address + self.words as u32 * 4
    }

    fn word(&self, address: u32) -> Option<*mut u32> {
        if address < self.address || address >= self.end() || address % 4 != 0 {
            return None;
        }
        let index = ((address - self.address) / 4) as usize;
        // SAFETY: index is within the mapped words
        Some(unsafe { self.ptr.add(index) })
    }
}

#[derive(Default)]
pub struct Bus {
    regions: Vec<Region>,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Places `words` words behind the highest mapped address.
    ///
    /// # Safety
    ///
    /// The memory must stay valid until the channel's regions are released.
    pub unsafe fn map(&mut self, channel: ChannelId, ptr: *mut u32, words: usize) -> u32 {
        let end = self
            .regions
            .iter()
            .map(Region::end)
            .max()
            .unwrap_or(RAM_BASE);
        let address = end.next_multiple_of(ALIGN);

        self.regions.push(Region {
            channel,
            address,
            ptr,
            words,
        });
        address
    }

    pub fn release(&mut self, channel: ChannelId) {
        self.regions.retain(|region| region.channel != channel);
    }

    pub fn is_mapped(&self, channel: ChannelId) -> bool {
        self.regions.iter().any(|region| region.channel == channel)
    }

    fn word(&self, address: u32) -> Result<*mut u32, BusFault> {
        self.regions
            .iter()
            .find_map(|region| region.word(address))
            .ok_or(BusFault { address })
    }

    pub fn read(&self, address: u32) -> Result<u32, BusFault> {
        let word = self.word(address)?;
        // SAFETY: the region is valid while mapped
        Ok(unsafe { word.read_volatile() })
    }

    pub fn write(&mut self, address: u32, value: u32) -> Result<(), BusFault> {
        let word = self.word(address)?;
        // SAFETY: the region is valid while mapped
        unsafe { word.write_volatile(value) };
        Ok(())
    }

    pub fn read_descriptor(&self, address: u32) -> Result<RawDescriptor, BusFault> {
        let mut words = [0; RawDescriptor::WORDS];
        for (i, word) in words.iter_mut().enumerate() {
            *word = self.read(address + i as u32 * 4)?;
        }
        Ok(RawDescriptor(words))
    }
}
