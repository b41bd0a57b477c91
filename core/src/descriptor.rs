//! LDMA transfer descriptors.
//!
//! A [`DescriptorChain`] is an arena of typed [`Descriptor`]s that link to
//! each other by index. Indices only become bus addresses when the chain is
//! encoded into a [`ChainSlot`], the memory the LDMA actually fetches from.

use core::fmt;

/// Descriptors per channel: a head transfer and a looping tail.
pub const CHAIN_LEN: usize = 2;

/// Largest XFERCNT the 11-bit field can hold, in elements.
pub const MAX_XFER_COUNT: u32 = 0x800;

const CTRL_STRUCTREQ: u32 = 1 << 3;
const CTRL_XFERCNT_SHIFT: u32 = 4;
const CTRL_XFERCNT_MASK: u32 = 0x7FF << CTRL_XFERCNT_SHIFT;
const CTRL_BLOCKSIZE_SHIFT: u32 = 16;
const CTRL_DONEIFS: u32 = 1 << 20;
const CTRL_REQMODE_ALL: u32 = 1 << 21;
const CTRL_DECLOOPCNT: u32 = 1 << 22;
const CTRL_SRCINC_SHIFT: u32 = 24;
const CTRL_SIZE_SHIFT: u32 = 26;
const CTRL_DSTINC_SHIFT: u32 = 28;
const CTRL_SRCMODE_RELATIVE: u32 = 1 << 30;
const CTRL_DSTMODE_RELATIVE: u32 = 1 << 31;

const LINK_MODE_RELATIVE: u32 = 1 << 0;
const LINK_ENABLE: u32 = 1 << 1;
const LINK_ADDR_MASK: u32 = !0b11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AddrMode {
    Absolute,
    /// Offset from the channel's current address register.
    Relative,
}

/// Address step after each element, in units of the element size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Increment {
    One = 0,
    Two = 1,
    Four = 2,
    None = 3,
}

impl Increment {
    const fn from_bits(bits: u32) -> Self {
        match bits & 0b11 {
            0 => Self::One,
            1 => Self::Two,
            2 => Self::Four,
            _ => Self::None,
        }
    }

    pub const fn elements(self) -> u32 {
        match self {
            Increment::One => 1,
            Increment::Two => 2,
            Increment::Four => 4,
            Increment::None => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ElementSize {
    Byte = 0,
    HalfWord = 1,
    Word = 2,
}

impl ElementSize {
    const fn from_bits(bits: u32) -> Option<Self> {
        match bits & 0b11 {
            0 => Some(Self::Byte),
            1 => Some(Self::HalfWord),
            2 => Some(Self::Word),
            _ => None,
        }
    }

    pub const fn bytes(self) -> u32 {
        1 << self as u32
    }
}

/// Elements moved per arbitration slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BlockSize {
    Unit1 = 0,
    Unit2 = 1,
    Unit3 = 2,
    Unit4 = 3,
    Unit6 = 4,
    Unit8 = 5,
    Unit16 = 7,
    Unit32 = 9,
    Unit64 = 10,
    Unit128 = 11,
    Unit256 = 12,
    Unit512 = 13,
    Unit1024 = 14,
    All = 15,
}

impl BlockSize {
    pub const fn from_bits(bits: u32) -> Option<Self> {
        Some(match bits & 0xF {
            0 => Self::Unit1,
            1 => Self::Unit2,
            2 => Self::Unit3,
            3 => Self::Unit4,
            4 => Self::Unit6,
            5 => Self::Unit8,
            7 => Self::Unit16,
            9 => Self::Unit32,
            10 => Self::Unit64,
            11 => Self::Unit128,
            12 => Self::Unit256,
            13 => Self::Unit512,
            14 => Self::Unit1024,
            15 => Self::All,
            _ => return None,
        })
    }

    /// Elements per block, `None` for a whole descriptor pass.
    pub const fn units(self) -> Option<u32> {
        Some(match self {
            BlockSize::Unit1 => 1,
            BlockSize::Unit2 => 2,
            BlockSize::Unit3 => 3,
            BlockSize::Unit4 => 4,
            BlockSize::Unit6 => 6,
            BlockSize::Unit8 => 8,
            BlockSize::Unit16 => 16,
            BlockSize::Unit32 => 32,
            BlockSize::Unit64 => 64,
            BlockSize::Unit128 => 128,
            BlockSize::Unit256 => 256,
            BlockSize::Unit512 => 512,
            BlockSize::Unit1024 => 1024,
            BlockSize::All => return None,
        })
    }
}

/// What a request transfers: one block, or the whole descriptor pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ReqMode {
    Block,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Link {
    /// The channel finishes after this descriptor.
    End,
    /// Continue with the descriptor at this arena index.
    Next(usize),
    /// Run this descriptor again while the channel loop counter is nonzero.
    Repeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Descriptor {
    pub src_mode: AddrMode,
    pub src: u32,
    pub src_inc: Increment,
    pub dst_mode: AddrMode,
    pub dst: u32,
    pub dst_inc: Increment,
    pub size: ElementSize,
    /// Elements per pass.
    pub xfer_count: u32,
    pub block_size: BlockSize,
    pub req_mode: ReqMode,
    pub struct_req: bool,
    pub done_ifs: bool,
    pub dec_loop_count: bool,
    pub link: Link,
}

impl Descriptor {
    /// A word-sized peripheral-to-memory transfer reading one fixed register.
    pub const fn peripheral_to_memory(source: u32, destination: u32, xfer_count: u32) -> Self {
        Self {
            src_mode: AddrMode::Absolute,
            src: source,
            src_inc: Increment::None,
            dst_mode: AddrMode::Absolute,
            dst: destination,
            dst_inc: Increment::One,
            size: ElementSize::Word,
            xfer_count,
            block_size: BlockSize::Unit32,
            req_mode: ReqMode::Block,
            struct_req: false,
            done_ifs: false,
            dec_loop_count: false,
            link: Link::End,
        }
    }

    /// Hardware words for this descriptor. `resolve` turns an arena index
    /// into the bus address of that descriptor.
    pub fn encode(&self, resolve: impl Fn(usize) -> u32) -> RawDescriptor {
        assert!((1..=MAX_XFER_COUNT).contains(&self.xfer_count));

        let mut ctrl = ((self.xfer_count - 1) << CTRL_XFERCNT_SHIFT)
            | ((self.block_size as u32) << CTRL_BLOCKSIZE_SHIFT)
            | ((self.src_inc as u32) << CTRL_SRCINC_SHIFT)
            | ((self.size as u32) << CTRL_SIZE_SHIFT)
            | ((self.dst_inc as u32) << CTRL_DSTINC_SHIFT);

        for (set, bit) in [
            (self.struct_req, CTRL_STRUCTREQ),
            (self.done_ifs, CTRL_DONEIFS),
            (self.req_mode == ReqMode::All, CTRL_REQMODE_ALL),
            (self.dec_loop_count, CTRL_DECLOOPCNT),
            (self.src_mode == AddrMode::Relative, CTRL_SRCMODE_RELATIVE),
            (self.dst_mode == AddrMode::Relative, CTRL_DSTMODE_RELATIVE),
        ] {
            if set {
                ctrl |= bit;
            }
        }

        let link = match self.link {
            Link::End => 0,
            Link::Next(index) => (resolve(index) & LINK_ADDR_MASK) | LINK_ENABLE,
            // Relative link to offset 0 with the link bit cleared: the loop
            // counter alone repeats the descriptor.
            Link::Repeat => LINK_MODE_RELATIVE,
        };

        RawDescriptor([ctrl, self.src, self.dst, link])
    }
}

/// A descriptor as the LDMA sees it in memory: CTRL, SRC, DST, LINK.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(C)]
pub struct RawDescriptor(pub [u32; 4]);

impl RawDescriptor {
    pub const WORDS: usize = 4;
    pub const BYTES: u32 = 16;

    pub const fn ctrl(&self) -> u32 {
        self.0[0]
    }

    pub const fn src(&self) -> u32 {
        self.0[1]
    }

    pub const fn dst(&self) -> u32 {
        self.0[2]
    }

    pub const fn link_word(&self) -> u32 {
        self.0[3]
    }

    pub const fn xfer_count(&self) -> u32 {
        ((self.ctrl() & CTRL_XFERCNT_MASK) >> CTRL_XFERCNT_SHIFT) + 1
    }

    pub const fn block_size(&self) -> Option<BlockSize> {
        BlockSize::from_bits(self.ctrl() >> CTRL_BLOCKSIZE_SHIFT)
    }

    pub const fn size(&self) -> Option<ElementSize> {
        ElementSize::from_bits(self.ctrl() >> CTRL_SIZE_SHIFT)
    }

    pub const fn src_inc(&self) -> Increment {
        Increment::from_bits(self.ctrl() >> CTRL_SRCINC_SHIFT)
    }

    pub const fn dst_inc(&self) -> Increment {
        Increment::from_bits(self.ctrl() >> CTRL_DSTINC_SHIFT)
    }

    pub const fn src_mode(&self) -> AddrMode {
        if self.ctrl() & CTRL_SRCMODE_RELATIVE != 0 {
            AddrMode::Relative
        } else {
            AddrMode::Absolute
        }
    }

    pub const fn dst_mode(&self) -> AddrMode {
        if self.ctrl() & CTRL_DSTMODE_RELATIVE != 0 {
            AddrMode::Relative
        } else {
            AddrMode::Absolute
        }
    }

    pub const fn req_mode(&self) -> ReqMode {
        if self.ctrl() & CTRL_REQMODE_ALL != 0 {
            ReqMode::All
        } else {
            ReqMode::Block
        }
    }

    pub const fn struct_req(&self) -> bool {
        self.ctrl() & CTRL_STRUCTREQ != 0
    }

    pub const fn done_ifs(&self) -> bool {
        self.ctrl() & CTRL_DONEIFS != 0
    }

    pub const fn dec_loop_count(&self) -> bool {
        self.ctrl() & CTRL_DECLOOPCNT != 0
    }

    pub const fn link_enabled(&self) -> bool {
        self.link_word() & LINK_ENABLE != 0
    }

    pub const fn link_mode(&self) -> AddrMode {
        if self.link_word() & LINK_MODE_RELATIVE != 0 {
            AddrMode::Relative
        } else {
            AddrMode::Absolute
        }
    }

    /// Link target; a byte offset from this descriptor in relative mode.
    pub const fn link_address(&self) -> u32 {
        self.link_word() & LINK_ADDR_MASK
    }
}

/// Descriptor memory for one channel. The LDMA requires word alignment;
/// 16 bytes keeps each descriptor on its own bus burst.
#[derive(Debug, Clone, Default)]
#[repr(C, align(16))]
pub struct ChainSlot([RawDescriptor; CHAIN_LEN]);

impl ChainSlot {
    pub const WORDS: usize = CHAIN_LEN * RawDescriptor::WORDS;

    pub const fn new() -> Self {
        Self([RawDescriptor([0; 4]); CHAIN_LEN])
    }

    pub fn descriptors(&self) -> &[RawDescriptor; CHAIN_LEN] {
        &self.0
    }

    pub fn clear(&mut self) {
        self.0 = [RawDescriptor::default(); CHAIN_LEN];
    }
}

/// Parameters of a "copy one register into a buffer, block by block" chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainParams {
    pub source: u32,
    pub destination: u32,
    /// Number of blocks, i.e. descriptor passes.
    pub count: u32,
    /// Elements per block.
    pub block_len: u32,
    pub block_size: BlockSize,
    /// Request the head descriptor on load instead of waiting for a trigger.
    pub software_request: bool,
    /// Raise the done interrupt at the end of the chain.
    pub done_interrupt: bool,
}

impl ChainParams {
    pub const fn new(source: u32, destination: u32, count: u32, block_len: u32) -> Self {
        Self {
            source,
            destination,
            count,
            block_len,
            block_size: BlockSize::Unit32,
            software_request: false,
            done_interrupt: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChainError {
    Empty,
    LinkOutOfRange { from: usize, to: usize },
    /// `Next` links loop back to an earlier descriptor.
    Cycle { at: usize },
    /// A `Repeat` descriptor that never decrements the loop counter.
    UnboundedRepeat { at: usize },
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainError::Empty => write!(f, "descriptor chain is empty"),
            ChainError::LinkOutOfRange { from, to } => {
                write!(f, "descriptor {from} links to missing descriptor {to}")
            }
            ChainError::Cycle { at } => write!(f, "descriptor chain revisits descriptor {at}"),
            ChainError::UnboundedRepeat { at } => {
                write!(f, "descriptor {at} repeats without decrementing the loop counter")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorChain {
    descriptors: heapless::Vec<Descriptor, CHAIN_LEN>,
    loop_count: u8,
    total_elements: u32,
}

impl DescriptorChain {
    /// Builds a chain that moves `count` blocks of `block_len` words from a
    /// fixed register into consecutive memory.
    ///
    /// The head descriptor writes the first block at `destination` and links
    /// to the tail. The tail continues relative to where the head stopped and
    /// repeats until the loop counter, programmed to `count - 2`, runs out.
    ///
    /// # Panics
    ///
    /// If `count` or `block_len` is outside `1..256`.
    pub fn build(params: ChainParams) -> Self {
        let ChainParams {
            source,
            destination,
            count,
            block_len,
            ..
        } = params;
        assert!((1..0x100).contains(&count), "count must be in 1..256");
        assert!((1..0x100).contains(&block_len), "block_len must be in 1..256");

        let mut head = Descriptor::peripheral_to_memory(source, destination, block_len);
        head.block_size = params.block_size;
        head.struct_req = params.software_request;

        // A chain is the head and at most one tail, which CHAIN_LEN holds.
        let mut descriptors = heapless::Vec::<Descriptor, CHAIN_LEN>::new();
        let mut push = |descriptor: Descriptor| {
            descriptors
                .push(descriptor)
                .ok()
                .expect("chain longer than CHAIN_LEN");
        };

        if count == 1 {
            head.done_ifs = params.done_interrupt;
            push(head);
        } else {
            head.link = Link::Next(1);

            let tail = Descriptor {
                dst_mode: AddrMode::Relative,
                dst: 0,
                dec_loop_count: true,
                struct_req: false,
                done_ifs: params.done_interrupt,
                link: Link::Repeat,
                ..head
            };

            push(head);
            push(tail);
        }

        Self {
            descriptors,
            loop_count: count.saturating_sub(2) as u8,
            total_elements: count * block_len,
        }
    }

    pub fn head(&self) -> usize {
        0
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    /// Value for the channel LOOP register.
    pub fn loop_count(&self) -> u8 {
        self.loop_count
    }

    pub fn total_elements(&self) -> u32 {
        self.total_elements
    }

    /// Checks that walking the chain from its head ends in `End` or in a
    /// loop-counted `Repeat`.
    pub fn validate(&self) -> Result<(), ChainError> {
        if self.descriptors.is_empty() {
            return Err(ChainError::Empty);
        }

        let mut visited = [false; CHAIN_LEN];
        let mut at = self.head();

        loop {
            if visited[at] {
                return Err(ChainError::Cycle { at });
            }
            visited[at] = true;

            let descriptor = &self.descriptors[at];
            match descriptor.link {
                Link::End => return Ok(()),
                Link::Repeat if descriptor.dec_loop_count => return Ok(()),
                Link::Repeat => return Err(ChainError::UnboundedRepeat { at }),
                Link::Next(to) if to >= self.descriptors.len() => {
                    return Err(ChainError::LinkOutOfRange { from: at, to })
                }
                Link::Next(to) => at = to,
            }
        }
    }

    /// Writes the hardware form of the chain into `slot`, which the LDMA
    /// will see at bus address `base`. Returns the head descriptor address.
    pub fn encode_into(&self, slot: &mut ChainSlot, base: u32) -> u32 {
        let resolve = |index: usize| base + index as u32 * RawDescriptor::BYTES;

        slot.clear();
        for (raw, descriptor) in slot.0.iter_mut().zip(&self.descriptors) {
            *raw = descriptor.encode(resolve);
        }

        resolve(self.head())
    }
}

#[cfg(test)]
impl DescriptorChain {
    pub(crate) fn descriptors_mut(&mut self) -> &mut heapless::Vec<Descriptor, CHAIN_LEN> {
        &mut self.descriptors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: u32 = crate::board::WTIMER0_CNT;
    const MEM: u32 = 0x2000_0100;

    #[test]
    fn two_descriptor_chain() {
        let chain = DescriptorChain::build(ChainParams::new(SOURCE, MEM, 4, 64));
        assert_eq!(chain.validate(), Ok(()));
        assert_eq!(chain.loop_count(), 2);
        assert_eq!(chain.total_elements(), 256);

        let [head, tail] = chain.descriptors() else {
            panic!("expected two descriptors");
        };
        assert_eq!(head.link, Link::Next(1));
        assert_eq!(head.dst_mode, AddrMode::Absolute);
        assert_eq!(head.dst, MEM);
        assert!(!head.dec_loop_count);

        assert_eq!(tail.link, Link::Repeat);
        assert_eq!(tail.dst_mode, AddrMode::Relative);
        assert_eq!(tail.dst, 0);
        assert!(tail.dec_loop_count);
        assert_eq!(tail.src, SOURCE);
        assert_eq!(tail.xfer_count, 64);
    }

    #[test]
    fn single_pass_has_no_loop() {
        let chain = DescriptorChain::build(ChainParams::new(SOURCE, MEM, 1, 17));
        assert_eq!(chain.descriptors().len(), 1);
        assert_eq!(chain.descriptors()[0].link, Link::End);
        assert_eq!(chain.loop_count(), 0);
        assert_eq!(chain.total_elements(), 17);
        assert_eq!(chain.validate(), Ok(()));
    }

    #[test]
    fn two_passes_run_the_tail_once() {
        let chain = DescriptorChain::build(ChainParams::new(SOURCE, MEM, 2, 8));
        assert_eq!(chain.descriptors().len(), 2);
        assert_eq!(chain.loop_count(), 0);
    }

    #[test]
    fn options_land_on_the_right_descriptor() {
        let mut params = ChainParams::new(SOURCE, MEM, 3, 10);
        params.software_request = true;
        params.done_interrupt = true;

        let chain = DescriptorChain::build(params);
        let [head, tail] = chain.descriptors() else {
            panic!("expected two descriptors");
        };
        assert!(head.struct_req && !head.done_ifs);
        assert!(!tail.struct_req && tail.done_ifs);

        let mut params = ChainParams::new(SOURCE, MEM, 1, 10);
        params.done_interrupt = true;
        assert!(DescriptorChain::build(params).descriptors()[0].done_ifs);
    }

    #[test]
    #[should_panic(expected = "count")]
    fn count_out_of_range() {
        DescriptorChain::build(ChainParams::new(SOURCE, MEM, 256, 1));
    }

    #[test]
    #[should_panic(expected = "count")]
    fn zero_count() {
        DescriptorChain::build(ChainParams::new(SOURCE, MEM, 0, 1));
    }

    #[test]
    #[should_panic(expected = "block_len")]
    fn block_len_out_of_range() {
        DescriptorChain::build(ChainParams::new(SOURCE, MEM, 1, 256));
    }

    #[test]
    fn encoding() {
        let chain = DescriptorChain::build(ChainParams::new(SOURCE, MEM, 4, 64));
        let mut slot = ChainSlot::new();
        let base = 0x2000_0040;
        assert_eq!(chain.encode_into(&mut slot, base), base);

        let [head, tail] = slot.descriptors();

        // XFERCNT=63, BLOCKSIZE=UNIT32, SRCINC=NONE, SIZE=WORD, DSTINC=ONE
        assert_eq!(head.ctrl(), (63 << 4) | (9 << 16) | (3 << 24) | (2 << 26));
        assert_eq!(head.src(), SOURCE);
        assert_eq!(head.dst(), MEM);
        assert_eq!(head.link_word(), (base + 16) | 0b10);

        assert_eq!(tail.ctrl(), head.ctrl() | (1 << 22) | (1 << 31));
        assert_eq!(tail.dst(), 0);
        assert_eq!(tail.link_word(), 0b01);
        assert!(!tail.link_enabled());
        assert_eq!(tail.link_mode(), AddrMode::Relative);
    }

    #[test]
    fn raw_accessors_read_back_typed_fields() {
        let mut params = ChainParams::new(SOURCE, MEM, 5, 255);
        params.block_size = BlockSize::Unit4;
        params.software_request = true;
        let chain = DescriptorChain::build(params);
        let mut slot = ChainSlot::new();
        chain.encode_into(&mut slot, 0x2000_1000);

        let [head, tail] = slot.descriptors();
        assert_eq!(head.xfer_count(), 255);
        assert_eq!(head.block_size(), Some(BlockSize::Unit4));
        assert_eq!(head.size(), Some(ElementSize::Word));
        assert_eq!(head.src_inc(), Increment::None);
        assert_eq!(head.dst_inc(), Increment::One);
        assert_eq!(head.req_mode(), ReqMode::Block);
        assert!(head.struct_req());
        assert!(head.link_enabled());
        assert_eq!(head.link_mode(), AddrMode::Absolute);
        assert_eq!(head.link_address(), 0x2000_1010);

        assert_eq!(tail.dst_mode(), AddrMode::Relative);
        assert_eq!(tail.src_mode(), AddrMode::Absolute);
        assert!(tail.dec_loop_count());
        assert!(!tail.done_ifs());
    }

    #[test]
    fn validation_errors() {
        let mut chain = DescriptorChain::build(ChainParams::new(SOURCE, MEM, 4, 8));
        chain.descriptors_mut()[1].dec_loop_count = false;
        assert_eq!(chain.validate(), Err(ChainError::UnboundedRepeat { at: 1 }));

        chain.descriptors_mut()[1].link = Link::Next(0);
        assert_eq!(chain.validate(), Err(ChainError::Cycle { at: 0 }));

        chain.descriptors_mut()[0].link = Link::Next(2);
        assert_eq!(
            chain.validate(),
            Err(ChainError::LinkOutOfRange { from: 0, to: 2 })
        );

        chain.descriptors_mut().clear();
        assert_eq!(chain.validate(), Err(ChainError::Empty));
    }
}
