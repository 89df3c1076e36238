//! Round-robin task scheduler.
//!
//! PCBs live in a slab and form a singly-linked ring of slot indices with
//! the idle task at the head. Selection starts at the current task's
//! successor and walks the ring: ready tasks are taken, expired sleepers are
//! promoted and taken, terminated tasks are unlinked and their resources
//! freed on the spot. If the scan comes back around empty, the idle task
//! runs.
//!
//! All operations here execute with interrupts disabled (the timer ISR and
//! explicit yields are the only entry points); interrupts are re-enabled by
//! the restored flags of the task being switched to.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use meson_core::addr::{PAGE_SIZE, PhysAddr};
use meson_mm::pmm::FrameBitmap;
use meson_mm::vmm::AddressSpaces;

use crate::SchedError;
use crate::context::{ContextSwitch, CpuContext};
use crate::process::{
    IDLE_STACK_SIZE, KERNEL_STACK_SIZE, Pcb, Priority, ProcState, prime_stack,
};

/// A re-schedule happens every this many timer ticks (10 ms at 1 kHz).
pub const RESCHEDULE_TICKS: u64 = 10;

/// The process table and scheduling state.
pub struct Scheduler {
    /// PCB slab; ring links are slot indices into this vector.
    slots: Vec<Option<Pcb>>,
    /// Slot of the idle task, the stable ring head.
    idle: usize,
    /// Slot of the task currently in the `Running` state.
    current: usize,
    /// Monotonic timer tick count (1 ms resolution).
    ticks: u64,
    /// Next PID to hand out.
    next_pid: u32,
    /// Direct-map offset for priming kernel stacks.
    direct_offset: usize,
}

impl Scheduler {
    /// Creates the scheduler and its idle task.
    ///
    /// The idle task gets a small kernel stack, the currently installed
    /// address space, and `idle_entry` as its entry point (an architecture
    /// halt loop).
    pub fn new(
        pmm: &mut FrameBitmap,
        vmm: &AddressSpaces,
        direct_offset: usize,
        idle_entry: u32,
    ) -> Result<Self, SchedError> {
        let addr_space = vmm.current().unwrap_or(PhysAddr::zero());
        let frames = (IDLE_STACK_SIZE / PAGE_SIZE) as usize;
        let stack = pmm
            .alloc_run(frames)
            .map_err(|_| SchedError::OutOfMemory)?
            .start_address();
        // SAFETY: the stack frames were just allocated for the idle task.
        let context =
            unsafe { prime_stack(direct_offset, stack, IDLE_STACK_SIZE, idle_entry, 0) };

        let idle = Pcb {
            pid: 0,
            name: String::from("idle"),
            state: ProcState::Running,
            priority: Priority::Low,
            context,
            addr_space,
            stack_base: stack,
            stack_size: IDLE_STACK_SIZE,
            wake_at: None,
            exit_code: 0,
            next: 0,
        };

        Ok(Self {
            slots: vec![Some(idle)],
            idle: 0,
            current: 0,
            ticks: 0,
            next_pid: 1,
            direct_offset,
        })
    }

    /// Spawns a new task and appends it to the ring in the `Ready` state.
    ///
    /// The task gets a clone of the current address space, a 16 KiB kernel
    /// stack, and a stack top primed for the first context switch.
    pub fn spawn(
        &mut self,
        pmm: &mut FrameBitmap,
        vmm: &AddressSpaces,
        name: &str,
        entry: u32,
        arg: u32,
        priority: Priority,
    ) -> Result<u32, SchedError> {
        let src = vmm.current().ok_or(SchedError::NoAddressSpace)?;
        let addr_space = vmm
            .clone_directory(src, pmm)
            .map_err(|_| SchedError::OutOfMemory)?;

        let frames = (KERNEL_STACK_SIZE / PAGE_SIZE) as usize;
        let stack = match pmm.alloc_run(frames) {
            Ok(frame) => frame.start_address(),
            Err(_) => {
                vmm.free_directory(addr_space, pmm);
                return Err(SchedError::OutOfMemory);
            }
        };
        // SAFETY: the stack frames were just allocated for this task.
        let context =
            unsafe { prime_stack(self.direct_offset, stack, KERNEL_STACK_SIZE, entry, arg) };

        let pid = self.next_pid;
        self.next_pid += 1;
        let pcb = Pcb {
            pid,
            name: String::from(name),
            state: ProcState::Ready,
            priority,
            context,
            addr_space,
            stack_base: stack,
            stack_size: KERNEL_STACK_SIZE,
            wake_at: None,
            exit_code: 0,
            next: self.idle,
        };

        let slot = self.insert(pcb);
        // Link in front of the head, i.e. at the tail of the ring.
        let tail = self.pred_of(self.idle);
        self.pcb_mut(tail).next = slot;
        Ok(pid)
    }

    /// Selects the next runnable task and context-switches to it.
    pub fn yield_now(
        &mut self,
        pmm: &mut FrameBitmap,
        vmm: &AddressSpaces,
        sw: &mut impl ContextSwitch,
    ) {
        let next = self.select_next(pmm, vmm);
        if next == self.current && self.slots[self.current].is_some() {
            return;
        }
        self.switch_to_slot(next, vmm, sw);
    }

    /// Blocks the current task until `ms` milliseconds have elapsed, then
    /// yields.
    pub fn sleep(
        &mut self,
        ms: u32,
        pmm: &mut FrameBitmap,
        vmm: &AddressSpaces,
        sw: &mut impl ContextSwitch,
    ) {
        let now = self.ticks;
        let cur = self.pcb_mut(self.current);
        cur.wake_at = Some(now + u64::from(ms));
        cur.state = ProcState::Blocked;
        self.yield_now(pmm, vmm, sw);
    }

    /// Terminates the current task with `code` and yields.
    ///
    /// Reaping is deferred to the scheduler pass that next visits the slot,
    /// so the dying task never frees its own stack.
    pub fn exit(
        &mut self,
        code: i32,
        pmm: &mut FrameBitmap,
        vmm: &AddressSpaces,
        sw: &mut impl ContextSwitch,
    ) {
        let cur = self.pcb_mut(self.current);
        cur.exit_code = code;
        cur.state = ProcState::Terminated;
        self.yield_now(pmm, vmm, sw);
    }

    /// Marks a task blocked (no wake deadline).
    pub fn block(&mut self, pid: u32) -> Result<(), SchedError> {
        let slot = self.slot_of(pid).ok_or(SchedError::NoSuchTask)?;
        self.pcb_mut(slot).state = ProcState::Blocked;
        Ok(())
    }

    /// Makes a blocked task runnable again.
    pub fn unblock(&mut self, pid: u32) -> Result<(), SchedError> {
        let slot = self.slot_of(pid).ok_or(SchedError::NoSuchTask)?;
        let pcb = self.pcb_mut(slot);
        if pcb.state == ProcState::Blocked {
            pcb.state = ProcState::Ready;
            pcb.wake_at = None;
        }
        Ok(())
    }

    /// Marks a task terminated.
    ///
    /// The target keeps running until the next re-schedule if it is the
    /// current task; the ring scan reaps it when it next visits the slot.
    pub fn terminate(&mut self, pid: u32) -> Result<(), SchedError> {
        if pid == 0 {
            // The idle task is the ring head and is never reaped.
            return Err(SchedError::NoSuchTask);
        }
        let slot = self.slot_of(pid).ok_or(SchedError::NoSuchTask)?;
        self.pcb_mut(slot).state = ProcState::Terminated;
        Ok(())
    }

    /// Timer tick: advances time and re-schedules every tenth tick.
    pub fn tick(
        &mut self,
        pmm: &mut FrameBitmap,
        vmm: &AddressSpaces,
        sw: &mut impl ContextSwitch,
    ) {
        self.ticks += 1;
        if self.ticks % RESCHEDULE_TICKS == 0 {
            self.yield_now(pmm, vmm, sw);
        }
    }

    /// Current tick count.
    pub fn now(&self) -> u64 {
        self.ticks
    }

    /// PID of the running task.
    pub fn current_pid(&self) -> u32 {
        self.slots[self.current].as_ref().map_or(0, |p| p.pid)
    }

    /// Number of live tasks, the idle task included.
    pub fn task_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// State of the task with the given PID, if it exists.
    pub fn state_of(&self, pid: u32) -> Option<ProcState> {
        self.slot_of(pid).map(|s| self.slots[s].as_ref().unwrap().state)
    }

    // -- ring internals ----------------------------------------------------

    fn pcb_mut(&mut self, slot: usize) -> &mut Pcb {
        self.slots[slot].as_mut().expect("live ring slot")
    }

    fn next_of(&self, slot: usize) -> usize {
        self.slots[slot].as_ref().expect("live ring slot").next
    }

    fn slot_of(&self, pid: u32) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|p| p.pid == pid))
    }

    fn insert(&mut self, pcb: Pcb) -> usize {
        if let Some(slot) = self.slots.iter().position(Option::is_none) {
            self.slots[slot] = Some(pcb);
            slot
        } else {
            self.slots.push(Some(pcb));
            self.slots.len() - 1
        }
    }

    /// Ring predecessor of `slot`.
    fn pred_of(&self, slot: usize) -> usize {
        let mut cur = self.idle;
        while self.next_of(cur) != slot {
            cur = self.next_of(cur);
        }
        cur
    }

    /// Unlinks and frees a terminated task, returning its ring successor.
    fn reap(&mut self, slot: usize, pmm: &mut FrameBitmap, vmm: &AddressSpaces) -> usize {
        debug_assert_ne!(slot, self.idle, "the idle task is never reaped");
        let pred = self.pred_of(slot);
        let pcb = self.slots[slot].take().expect("live ring slot");
        self.pcb_mut(pred).next = pcb.next;

        pmm.free_run(pcb.stack_base, pcb.stack_frames());
        vmm.free_directory(pcb.addr_space, pmm);
        pcb.next
    }

    /// Walks the ring from the current task's successor and applies the
    /// selection rules, reaping terminated tasks along the way.
    fn select_next(&mut self, pmm: &mut FrameBitmap, vmm: &AddressSpaces) -> usize {
        let mut start = self.next_of(self.current);
        let mut cand = start;

        loop {
            match self.slots[cand].as_ref().expect("live ring slot").state {
                ProcState::Ready => return cand,
                ProcState::Blocked => {
                    let now = self.ticks;
                    let pcb = self.pcb_mut(cand);
                    if pcb.wake_at.is_some_and(|wake| wake <= now) {
                        pcb.state = ProcState::Ready;
                        pcb.wake_at = None;
                        return cand;
                    }
                }
                ProcState::Terminated => {
                    let succ = self.reap(cand, pmm, vmm);
                    if cand == start {
                        start = succ;
                    }
                    cand = succ;
                    if self.task_count() == 1 {
                        return self.idle;
                    }
                    continue;
                }
                ProcState::Running => {}
            }

            cand = self.next_of(cand);
            if cand == start {
                break;
            }
        }

        self.idle
    }

    /// Performs the state bookkeeping and the context switch to `next_idx`.
    fn switch_to_slot(
        &mut self,
        next_idx: usize,
        vmm: &AddressSpaces,
        sw: &mut impl ContextSwitch,
    ) {
        let prev_idx = self.current;
        let (next_ctx, next_space) = {
            let next = self.pcb_mut(next_idx);
            next.state = ProcState::Running;
            (next.context, next.addr_space)
        };
        self.current = next_idx;

        match self.slots[prev_idx].as_mut() {
            Some(prev) => {
                // Demote unless the task entered the yield blocked or
                // terminated.
                if prev.state == ProcState::Running {
                    prev.state = ProcState::Ready;
                }
                if prev.addr_space != next_space {
                    vmm.switch_to(next_space);
                }
                sw.switch(&mut prev.context, &next_ctx);
            }
            None => {
                // The outgoing task was reaped during the scan; there is no
                // PCB to save into, and it will never resume.
                let mut scratch = CpuContext::default();
                vmm.switch_to(next_space);
                sw.switch(&mut scratch, &next_ctx);
            }
        }
    }
}
