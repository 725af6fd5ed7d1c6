//! Recording machine for host tests.
//!
//! Physical memory is a sparse map of boxed frames created zeroed on first
//! touch. Context switches are recorded but do not change the host stack;
//! one-way transfers unwind with a [`Resumed`] payload.

use super::{Arch, KernelContext};
use crate::trap::TrapFrame;
use core::cell::UnsafeCell;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualAddress};
use kernel_sync::{FlagIrq, Irq};
use kernel_vmem::{Mmu, PhysMapper};
use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

#[repr(align(4096))]
struct Frame(UnsafeCell<[u8; 4096]>);

/// Sparse simulated RAM.
#[derive(Default)]
pub(crate) struct SimPhys {
    frames: Mutex<HashMap<u32, Box<Frame>>>,
}

// SAFETY: frames are boxed and never moved or freed while the map lives.
unsafe impl Sync for SimPhys {}
unsafe impl Send for SimPhys {}

impl PhysMapper for SimPhys {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let mut frames = self.frames.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let frame = frames
            .entry(pa.as_u32() >> 12)
            .or_insert_with(|| Box::new(Frame(UnsafeCell::new([0; 4096]))));
        let base = frame.0.get().cast::<u8>();
        unsafe { &mut *base.add((pa.as_u32() & 0xFFF) as usize).cast::<T>() }
    }
}

/// Payload of a simulated return to user mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Resumed(pub TrapFrame);

/// Payload of a simulated halt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Halted;

pub(crate) struct SimArch {
    pub phys: SimPhys,
    irq: FlagIrq,
    active: AtomicU32,
    pub invalidated: Mutex<Vec<VirtualAddress>>,
    pub flushes: AtomicUsize,
    pub switches: Mutex<Vec<(u32, u32)>>,
    pub esp0: AtomicU32,
    pub screen: Mutex<(Vec<u16>, (usize, usize))>,
    pub scancodes: Mutex<VecDeque<u8>>,
    pub eois: Mutex<Vec<u32>>,
}

impl SimArch {
    pub fn new() -> Self {
        Self {
            phys: SimPhys::default(),
            irq: FlagIrq::new(true),
            active: AtomicU32::new(0),
            invalidated: Mutex::new(Vec::new()),
            flushes: AtomicUsize::new(0),
            switches: Mutex::new(Vec::new()),
            esp0: AtomicU32::new(0),
            screen: Mutex::new((Vec::new(), (0, 0))),
            scancodes: Mutex::new(VecDeque::new()),
            eois: Mutex::new(Vec::new()),
        }
    }

    pub fn switch_count(&self) -> usize {
        self.switches.lock().unwrap().len()
    }

    pub fn screen_text(&self, row: usize) -> String {
        let screen = self.screen.lock().unwrap();
        screen.0[row * super::CONSOLE_COLS..(row + 1) * super::CONSOLE_COLS]
            .iter()
            .map(|c| char::from((c & 0xFF) as u8))
            .collect::<String>()
            .trim_end()
            .to_string()
    }
}

impl Irq for SimArch {
    fn interrupts_enabled(&self) -> bool {
        self.irq.interrupts_enabled()
    }

    fn disable_interrupts(&self) {
        self.irq.disable_interrupts();
    }

    fn enable_interrupts(&self) {
        self.irq.enable_interrupts();
    }
}

impl Mmu for SimArch {
    fn activate(&self, root: PhysicalPage) {
        self.active.store(root.number(), Ordering::SeqCst);
    }

    fn active(&self) -> PhysicalPage {
        PhysicalPage::from_number(self.active.load(Ordering::SeqCst))
    }

    fn invalidate(&self, va: VirtualAddress) {
        self.invalidated.lock().unwrap().push(va);
    }

    fn flush_all(&self) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }
}

impl Arch for SimArch {
    type Mapper = SimPhys;

    fn mapper(&self) -> &SimPhys {
        &self.phys
    }

    fn cpu_id(&self) -> u32 {
        0
    }

    fn initial_context(&self, stack: PhysicalPage) -> KernelContext {
        KernelContext {
            esp: stack.base().as_u32() + TrapFrame::user_frame_offset() as u32 - 16,
        }
    }

    unsafe fn switch_context(&self, from: *mut KernelContext, to: *const KernelContext) {
        let (from, to) = unsafe { ((*from).esp, (*to).esp) };
        self.switches.lock().unwrap().push((from, to));
    }

    fn set_kernel_stack(&self, top: VirtualAddress) {
        self.esp0.store(top.as_u32(), Ordering::SeqCst);
    }

    fn frame_pointer(&self) -> u32 {
        0
    }

    fn resume(&self, frame: &TrapFrame) -> ! {
        std::panic::panic_any(Resumed(*frame))
    }

    fn end_of_interrupt(&self, vector: u32) {
        self.eois.lock().unwrap().push(vector);
    }

    fn read_scancode(&self) -> u8 {
        self.scancodes.lock().unwrap().pop_front().unwrap_or(0)
    }

    fn wait_for_interrupt(&self) {}

    fn halt(&self) -> ! {
        std::panic::panic_any(Halted)
    }

    fn show(&self, cells: &[u16], cursor: (usize, usize)) {
        let mut screen = self.screen.lock().unwrap();
        screen.0 = cells.to_vec();
        screen.1 = cursor;
    }
}

/// Runs `f`, which must end in a one-way transfer, and returns the frame it
/// resumed.
pub(crate) fn expect_resume(f: impl FnOnce()) -> TrapFrame {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => panic!("expected a one-way transfer, returned normally"),
        Err(payload) => match payload.downcast::<Resumed>() {
            Ok(resumed) => resumed.0,
            Err(other) => std::panic::resume_unwind(other),
        },
    }
}

/// Runs `f` and reports whether it halted the machine.
pub(crate) fn expect_halt(f: impl FnOnce()) {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => panic!("expected a halt"),
        Err(payload) => {
            if payload.downcast_ref::<Halted>().is_none() {
                std::panic::resume_unwind(payload);
            }
        }
    }
}
