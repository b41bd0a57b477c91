//! Raw register access for the few EFM32GG11 peripherals the harness touches.

pub(crate) unsafe fn read(address: u32) -> u32 {
    core::ptr::read_volatile(address as usize as *const u32)
}

pub(crate) unsafe fn write(address: u32, value: u32) {
    core::ptr::write_volatile(address as usize as *mut u32, value)
}

pub(crate) unsafe fn modify(address: u32, f: impl FnOnce(u32) -> u32) {
    write(address, f(read(address)))
}
