//! In-process mock of the kernel contract for the test suite.
//!
//! Frames are plain byte buffers, register files are hash maps, and the
//! fault endpoint is a scripted queue of [`ExitEvent`]s. Every invocation
//! is recorded so tests can assert on what the runtime asked the kernel
//! to do.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use super::{
    Cap, ExitEvent, Frame, KernelError, KernelOps, MapRights, Mrs, Result, TcbRegs, VmEnterResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub vspace: Cap,
    pub frame: Cap,
    pub gpa: u64,
    pub rights: MapRights,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Injection {
    pub vcpu: Cap,
    pub virq: u32,
    pub priority: u8,
    pub group: u8,
    pub index: u8,
}

#[derive(Default)]
struct MockState {
    next_cap: u64,
    frames: HashMap<u64, Vec<u8>>,
    mappings: Vec<Mapping>,
    vcpu_regs: HashMap<u64, HashMap<u32, u64>>,
    tcb_regs: HashMap<u64, TcbRegs>,
    tcb_resumed: HashMap<u64, bool>,
    events: VecDeque<ExitEvent>,
    enters: VecDeque<VmEnterResult>,
    replies: Vec<Vec<u64>>,
    published_entries: Vec<[u64; 3]>,
    injections: Vec<Injection>,
    acked_vppis: Vec<(Cap, u32)>,
}

/// Scriptable kernel double. See module docs.
pub struct MockKernel {
    state: Mutex<MockState>,
}

impl MockKernel {
    pub fn new() -> Self {
        MockKernel {
            state: Mutex::new(MockState {
                next_cap: 1,
                ..MockState::default()
            }),
        }
    }

    fn fresh_cap(state: &mut MockState) -> Cap {
        let cap = Cap(state.next_cap);
        state.next_cap += 1;
        cap
    }

    /// Queue an event for the next `wait_exit`.
    pub fn push_exit(&self, event: ExitEvent) {
        self.state.lock().unwrap().events.push_back(event);
    }

    /// Queue a result for the next `vm_enter`.
    pub fn push_enter(&self, result: VmEnterResult) {
        self.state.lock().unwrap().enters.push_back(result);
    }

    /// Pre-load a vCPU register so a later `vcpu_read_reg` sees it.
    pub fn preload_vcpu_reg(&self, vcpu: Cap, field: u32, value: u64) {
        self.state
            .lock()
            .unwrap()
            .vcpu_regs
            .entry(vcpu.0)
            .or_default()
            .insert(field, value);
    }

    pub fn vcpu_reg(&self, vcpu: Cap, field: u32) -> Option<u64> {
        self.state
            .lock()
            .unwrap()
            .vcpu_regs
            .get(&vcpu.0)
            .and_then(|m| m.get(&field).copied())
    }

    pub fn tcb_regs_of(&self, tcb: Cap) -> TcbRegs {
        self.state
            .lock()
            .unwrap()
            .tcb_regs
            .get(&tcb.0)
            .copied()
            .unwrap_or_default()
    }

    pub fn set_tcb_regs(&self, tcb: Cap, regs: TcbRegs) {
        self.state.lock().unwrap().tcb_regs.insert(tcb.0, regs);
    }

    pub fn is_resumed(&self, tcb: Cap) -> bool {
        self.state
            .lock()
            .unwrap()
            .tcb_resumed
            .get(&tcb.0)
            .copied()
            .unwrap_or(false)
    }

    pub fn injections(&self) -> Vec<Injection> {
        self.state.lock().unwrap().injections.clone()
    }

    pub fn replies(&self) -> Vec<Vec<u64>> {
        self.state.lock().unwrap().replies.clone()
    }

    pub fn published_entries(&self) -> Vec<[u64; 3]> {
        self.state.lock().unwrap().published_entries.clone()
    }

    pub fn mappings(&self) -> Vec<Mapping> {
        self.state.lock().unwrap().mappings.clone()
    }

    pub fn acked_vppis(&self) -> Vec<(Cap, u32)> {
        self.state.lock().unwrap().acked_vppis.clone()
    }

    /// Copy out a frame's current contents.
    pub fn frame_bytes(&self, frame: Cap) -> Vec<u8> {
        self.state
            .lock()
            .unwrap()
            .frames
            .get(&frame.0)
            .cloned()
            .unwrap_or_default()
    }
}

impl KernelOps for MockKernel {
    fn create_vspace(&self) -> Result<Cap> {
        Ok(Self::fresh_cap(&mut self.state.lock().unwrap()))
    }

    fn create_cspace(&self) -> Result<Cap> {
        Ok(Self::fresh_cap(&mut self.state.lock().unwrap()))
    }

    fn create_endpoint(&self) -> Result<Cap> {
        Ok(Self::fresh_cap(&mut self.state.lock().unwrap()))
    }

    fn create_vcpu(&self) -> Result<Cap> {
        let mut state = self.state.lock().unwrap();
        let cap = Self::fresh_cap(&mut state);
        state.vcpu_regs.insert(cap.0, HashMap::new());
        Ok(cap)
    }

    fn create_tcb(&self, _priority: u8) -> Result<Cap> {
        let mut state = self.state.lock().unwrap();
        let cap = Self::fresh_cap(&mut state);
        state.tcb_regs.insert(cap.0, TcbRegs::default());
        state.tcb_resumed.insert(cap.0, false);
        Ok(cap)
    }

    fn bind_vcpu_tcb(&self, _vcpu: Cap, _tcb: Cap) -> Result<()> {
        Ok(())
    }

    fn mint_badged_endpoint(&self, _endpoint: Cap, _badge: u64) -> Result<Cap> {
        Ok(Self::fresh_cap(&mut self.state.lock().unwrap()))
    }

    fn set_tcb_fault_endpoint(&self, _tcb: Cap, _badged: Cap) -> Result<()> {
        Ok(())
    }

    fn delete_cap(&self, _cap: Cap) -> Result<()> {
        Ok(())
    }

    fn tcb_resume(&self, tcb: Cap) -> Result<()> {
        self.state.lock().unwrap().tcb_resumed.insert(tcb.0, true);
        Ok(())
    }

    fn tcb_suspend(&self, tcb: Cap) -> Result<()> {
        self.state.lock().unwrap().tcb_resumed.insert(tcb.0, false);
        Ok(())
    }

    fn tcb_read_regs(&self, tcb: Cap) -> Result<TcbRegs> {
        Ok(self.tcb_regs_of(tcb))
    }

    fn tcb_write_regs(&self, tcb: Cap, regs: &TcbRegs) -> Result<()> {
        self.state.lock().unwrap().tcb_regs.insert(tcb.0, *regs);
        Ok(())
    }

    fn vcpu_read_reg(&self, vcpu: Cap, field: u32) -> Result<u64> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .vcpu_regs
            .get(&vcpu.0)
            .and_then(|m| m.get(&field).copied())
            .unwrap_or(0))
    }

    fn vcpu_write_reg(&self, vcpu: Cap, field: u32, value: u64) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .vcpu_regs
            .entry(vcpu.0)
            .or_default()
            .insert(field, value);
        Ok(())
    }

    fn wait_exit(&self, _endpoint: Cap) -> Result<ExitEvent> {
        self.state
            .lock()
            .unwrap()
            .events
            .pop_front()
            .ok_or(KernelError::NoEvent)
    }

    fn save_reply(&self) -> Result<Cap> {
        Ok(Self::fresh_cap(&mut self.state.lock().unwrap()))
    }

    fn send_reply(&self, _reply: Cap, mrs: &[u64]) -> Result<()> {
        self.state.lock().unwrap().replies.push(mrs.to_vec());
        Ok(())
    }

    fn vm_enter(&self, _vcpu: Cap, mrs: &[u64; 3]) -> Result<VmEnterResult> {
        let mut state = self.state.lock().unwrap();
        state.published_entries.push(*mrs);
        state.enters.pop_front().ok_or(KernelError::NoEvent)
    }

    fn alloc_frame(&self, size_bits: u8) -> Result<Frame> {
        let mut state = self.state.lock().unwrap();
        let cap = Self::fresh_cap(&mut state);
        state.frames.insert(cap.0, vec![0u8; 1usize << size_bits]);
        Ok(Frame { cap, size_bits })
    }

    fn alloc_frame_at(&self, _paddr: u64, size_bits: u8) -> Result<Frame> {
        self.alloc_frame(size_bits)
    }

    fn free_frame(&self, frame: Frame) -> Result<()> {
        self.state.lock().unwrap().frames.remove(&frame.cap.0);
        Ok(())
    }

    fn map_frame(&self, vspace: Cap, frame: &Frame, gpa: u64, rights: MapRights) -> Result<()> {
        self.state.lock().unwrap().mappings.push(Mapping {
            vspace,
            frame: frame.cap,
            gpa,
            rights,
        });
        Ok(())
    }

    fn unmap_frame(&self, vspace: Cap, frame: &Frame, gpa: u64) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .mappings
            .retain(|m| !(m.vspace == vspace && m.frame == frame.cap && m.gpa == gpa));
        Ok(())
    }

    fn frame_data(&self, frame: &Frame, f: &mut dyn FnMut(&mut [u8])) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let bytes = state
            .frames
            .get_mut(&frame.cap.0)
            .ok_or(KernelError::InvocationFailed {
                invocation: "frame_data",
                code: 1,
            })?;
        f(bytes);
        Ok(())
    }

    fn vcpu_inject_irq(
        &self,
        vcpu: Cap,
        virq: u32,
        priority: u8,
        group: u8,
        index: u8,
    ) -> Result<()> {
        self.state.lock().unwrap().injections.push(Injection {
            vcpu,
            virq,
            priority,
            group,
            index,
        });
        Ok(())
    }

    fn vcpu_ack_vppi(&self, vcpu: Cap, irq: u32) -> Result<()> {
        self.state.lock().unwrap().acked_vppis.push((vcpu, irq));
        Ok(())
    }

    fn irq_ack(&self, _irq: Cap) -> Result<()> {
        Ok(())
    }
}

/// Convenience: an event with the given badge and label and no payload.
pub fn notification(badge: u64) -> ExitEvent {
    ExitEvent {
        badge,
        label: super::ExitLabel::Notification,
        mrs: Mrs::empty(),
    }
}
