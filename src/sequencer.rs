//! Read sequencing for the two ADC channels.
//!
//! The digitizer runs five small hardware-clocked machines that only talk to
//! each other through IRQ flags: a master clock, a data-ready watcher, one
//! read-line driver per channel and a shifter that clocks both channels' words
//! out of a shared data line. Each machine here is an explicit state enum
//! stepped once per machine cycle against an [`AdcBus`].

use crate::{config::OutputMode, WORD_BITS};

/// DRL fell, a decimated pair is latched
pub const IRQ_CONVERSION: u8 = 0;
/// I read line is low, shift the I word
pub const IRQ_SHIFT_I: u8 = 1;
pub const IRQ_I_DONE: u8 = 2;
pub const IRQ_Q_DONE: u8 = 3;
/// I read line released, Q may take the data line
pub const IRQ_HANDOFF: u8 = 4;
pub const IRQ_SHIFT_Q: u8 = 5;

/// Hardware events the machines react to
pub trait AdcBus {
    /// Master clock level for this cycle
    fn clock(&mut self, mclk: bool);
    /// Data-ready line, falls when a new decimated pair has been latched
    fn data_ready(&self) -> bool;
    /// Rising serial clock edge. The converter whose read line is held low
    /// drives its next bit (MSB first) onto the shared data line.
    fn shift_out(&mut self, read_lines: [bool; 2]) -> bool;
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct IrqFlags(u8);

impl IrqFlags {
    pub fn raise(&mut self, irq: u8) {
        self.0 |= 1 << irq;
    }

    pub fn clear(&mut self, irq: u8) {
        self.0 &= !(1 << irq);
    }

    pub fn is_raised(&self, irq: u8) -> bool {
        self.0 & (1 << irq) != 0
    }

    /// Consume a raised flag, the way a machine waiting on it does
    pub fn take(&mut self, irq: u8) -> bool {
        let raised = self.is_raised(irq);
        self.clear(irq);
        raised
    }

    pub fn clear_all(&mut self) {
        self.0 = 0;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Channel {
    I,
    Q,
}

impl Channel {
    pub fn index(self) -> usize {
        match self {
            Channel::I => 0,
            Channel::Q => 1,
        }
    }

    fn other(self) -> Self {
        match self {
            Channel::I => Channel::Q,
            Channel::Q => Channel::I,
        }
    }

    fn shift_irq(self) -> u8 {
        match self {
            Channel::I => IRQ_SHIFT_I,
            Channel::Q => IRQ_SHIFT_Q,
        }
    }

    fn done_irq(self) -> u8 {
        match self {
            Channel::I => IRQ_I_DONE,
            Channel::Q => IRQ_Q_DONE,
        }
    }
}

/// Levels of every line the machines drive
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lines {
    pub mclk: bool,
    pub sync: bool,
    pub sck: bool,
    /// Active-low read enables of each converter's A port
    pub rdla: [bool; 2],
    /// Active-low read enables of each converter's B port
    pub rdlb: [bool; 2],
}

impl Lines {
    fn idle(mode: OutputMode) -> Self {
        Self {
            mclk: false,
            sync: false,
            sck: false,
            rdla: [true; 2],
            rdlb: [mode == OutputMode::Filtered; 2],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClockState {
    /// Cycles left in the phase
    High(u32),
    Low(u32),
}

#[derive(Clone, Debug)]
pub struct MasterClock {
    high_cycles: u32,
    low_cycles: u32,
    state: ClockState,
}

impl MasterClock {
    pub fn new(high_cycles: u32, low_cycles: u32) -> Self {
        let high_cycles = high_cycles.max(1);
        Self {
            high_cycles,
            low_cycles: low_cycles.max(1),
            state: ClockState::High(high_cycles),
        }
    }

    /// Machine cycles per clock period
    pub fn period(&self) -> u32 {
        self.high_cycles + self.low_cycles
    }

    fn reset(&mut self) {
        self.state = ClockState::High(self.high_cycles);
    }

    fn step(&mut self, lines: &mut Lines) {
        self.state = match self.state {
            ClockState::High(n) => {
                lines.mclk = true;
                if n <= 1 {
                    ClockState::Low(self.low_cycles)
                } else {
                    ClockState::High(n - 1)
                }
            }
            ClockState::Low(n) => {
                lines.mclk = false;
                if n <= 1 {
                    ClockState::High(self.high_cycles)
                } else {
                    ClockState::Low(n - 1)
                }
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrlState {
    AwaitHigh,
    AwaitLow,
    /// SYNC is high for one cycle after a conversion
    Pulse,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadIState {
    AwaitConversion,
    AwaitShiftDone,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadQState {
    /// Drops any stale Q-done flag before waiting
    Arm,
    AwaitHandoff,
    AwaitShiftDone,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShiftState {
    AwaitChannel(Channel),
    Shifting { channel: Channel, remaining: u32 },
}

fn drl_step(state: DrlState, drl: bool, irq: &mut IrqFlags, lines: &mut Lines) -> DrlState {
    match state {
        DrlState::AwaitHigh if drl => DrlState::AwaitLow,
        DrlState::AwaitLow if !drl => {
            irq.raise(IRQ_CONVERSION);
            lines.sync = true;
            DrlState::Pulse
        }
        DrlState::Pulse => {
            lines.sync = false;
            DrlState::AwaitHigh
        }
        s => s,
    }
}

fn read_i_step(state: ReadIState, irq: &mut IrqFlags, lines: &mut Lines) -> ReadIState {
    match state {
        ReadIState::AwaitConversion if irq.take(IRQ_CONVERSION) => {
            lines.rdla[Channel::I.index()] = false;
            irq.raise(IRQ_SHIFT_I);
            ReadIState::AwaitShiftDone
        }
        ReadIState::AwaitShiftDone if irq.take(IRQ_I_DONE) => {
            lines.rdla[Channel::I.index()] = true;
            irq.raise(IRQ_HANDOFF);
            ReadIState::AwaitConversion
        }
        s => s,
    }
}

fn read_q_step(state: ReadQState, irq: &mut IrqFlags, lines: &mut Lines) -> ReadQState {
    match state {
        ReadQState::Arm => {
            irq.clear(IRQ_Q_DONE);
            ReadQState::AwaitHandoff
        }
        ReadQState::AwaitHandoff if irq.take(IRQ_HANDOFF) => {
            lines.rdla[Channel::Q.index()] = false;
            irq.raise(IRQ_SHIFT_Q);
            ReadQState::AwaitShiftDone
        }
        ReadQState::AwaitShiftDone if irq.take(IRQ_Q_DONE) => {
            lines.rdla[Channel::Q.index()] = true;
            ReadQState::Arm
        }
        s => s,
    }
}

/// Every machine plus the flags and lines they share
#[derive(Clone, Debug)]
pub struct Sequencer {
    mode: OutputMode,
    irq: IrqFlags,
    lines: Lines,
    clock: MasterClock,
    drl: DrlState,
    read_i: ReadIState,
    read_q: ReadQState,
    shift: ShiftState,
    isr: u32,
}

impl Sequencer {
    pub fn new(mode: OutputMode, clock: MasterClock) -> Self {
        Self {
            mode,
            irq: IrqFlags::default(),
            lines: Lines::idle(mode),
            clock,
            drl: DrlState::AwaitHigh,
            read_i: ReadIState::AwaitConversion,
            read_q: ReadQState::Arm,
            shift: ShiftState::AwaitChannel(Channel::I),
            isr: 0,
        }
    }

    /// Start sequence: read lines high, serial clock low, no pending IRQs
    pub fn reset(&mut self) {
        self.irq.clear_all();
        self.lines = Lines::idle(self.mode);
        self.clock.reset();
        self.drl = DrlState::AwaitHigh;
        self.read_i = ReadIState::AwaitConversion;
        self.read_q = ReadQState::Arm;
        self.shift = ShiftState::AwaitChannel(Channel::I);
        self.isr = 0;
    }

    pub fn lines(&self) -> Lines {
        self.lines
    }

    pub fn irq(&self) -> IrqFlags {
        self.irq
    }

    pub fn shift_state(&self) -> ShiftState {
        self.shift
    }

    /// Advance every machine one cycle, returning a word if the shifter
    /// completed one (I and Q alternate)
    pub fn step<A: AdcBus>(&mut self, adc: &mut A) -> Option<u32> {
        self.clock.step(&mut self.lines);
        adc.clock(self.lines.mclk);
        self.drl = drl_step(self.drl, adc.data_ready(), &mut self.irq, &mut self.lines);
        self.read_i = read_i_step(self.read_i, &mut self.irq, &mut self.lines);
        self.read_q = read_q_step(self.read_q, &mut self.irq, &mut self.lines);
        self.shift_step(adc)
    }

    fn shift_step<A: AdcBus>(&mut self, adc: &mut A) -> Option<u32> {
        match self.shift {
            ShiftState::AwaitChannel(channel) => {
                if self.irq.take(channel.shift_irq()) {
                    self.isr = 0;
                    self.shift = ShiftState::Shifting {
                        channel,
                        remaining: WORD_BITS,
                    };
                }
                None
            }
            ShiftState::Shifting { channel, remaining } => {
                self.lines.sck = true;
                let bit = adc.shift_out(self.lines.rdla);
                self.lines.sck = false;
                self.isr = (self.isr << 1) | bit as u32;
                if remaining > 1 {
                    self.shift = ShiftState::Shifting {
                        channel,
                        remaining: remaining - 1,
                    };
                    return None;
                }
                // Autopush at 32 bits
                self.irq.raise(channel.done_irq());
                self.shift = ShiftState::AwaitChannel(channel.other());
                Some(self.isr)
            }
        }
    }
}
