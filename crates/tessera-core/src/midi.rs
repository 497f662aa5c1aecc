//! Lock-free MIDI event queue (control thread → audio thread)
//!
//! Note events cross the thread boundary through a bounded single-producer
//! single-consumer `rtrb` ring. Both ends are wait-free: the producer does a
//! relaxed load of its own write index, an acquire load of the reader's index
//! and a release store after writing the slot; the consumer mirrors that.
//!
//! A full queue rejects the push and hands the event back to the caller
//! (the engine counts it as dropped). An empty queue makes `pop` return
//! `None` immediately.
//!
//! ```ignore
//! let (mut tx, mut rx) = midi_channel(256);
//!
//! // Control thread
//! tx.send(MidiEvent::note_on(60, 1.0, 0))?;
//!
//! // Audio thread, top of every block
//! while let Some(event) = rx.pop() { /* dispatch */ }
//! ```

/// Default queue capacity (events)
pub const DEFAULT_MIDI_QUEUE_CAPACITY: usize = 256;

/// Kind of note event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MidiKind {
    NoteOn,
    NoteOff,
}

/// A note event, plain data so it can live in the lock-free ring
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MidiEvent {
    pub kind: MidiKind,
    /// MIDI note number (0..=127)
    pub note: u8,
    /// Normalised velocity (0..=1)
    pub velocity: f32,
    /// Frame offset inside the block in which the event is dispatched
    pub sample_offset: u32,
}

impl MidiEvent {
    /// Build a note-on; note is clamped to 0..=127, velocity to 0..=1
    pub fn note_on(note: i32, velocity: f32, sample_offset: u32) -> Self {
        Self {
            kind: MidiKind::NoteOn,
            note: clamp_note(note),
            velocity: clamp_velocity(velocity),
            sample_offset,
        }
    }

    /// Build a note-off; note is clamped to 0..=127
    pub fn note_off(note: i32, sample_offset: u32) -> Self {
        Self {
            kind: MidiKind::NoteOff,
            note: clamp_note(note),
            velocity: 0.0,
            sample_offset,
        }
    }

    /// Note-on with zero velocity is treated as note-off (MIDI running status convention)
    pub fn is_release(&self) -> bool {
        self.kind == MidiKind::NoteOff || self.velocity <= 0.0
    }
}

#[inline]
fn clamp_note(note: i32) -> u8 {
    note.clamp(0, 127) as u8
}

#[inline]
fn clamp_velocity(velocity: f32) -> f32 {
    if velocity.is_finite() {
        velocity.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Producer side, owned by the control thread
pub struct MidiSender {
    producer: rtrb::Producer<MidiEvent>,
}

impl MidiSender {
    /// Queue an event (non-blocking)
    ///
    /// Returns `Err(event)` if the queue is full; existing entries are untouched.
    pub fn send(&mut self, event: MidiEvent) -> Result<(), MidiEvent> {
        self.producer.push(event).map_err(|e| match e {
            rtrb::PushError::Full(value) => value,
        })
    }

    /// Free slots left in the queue
    pub fn slots(&self) -> usize {
        self.producer.slots()
    }
}

/// Consumer side, owned by the audio thread
pub struct MidiReceiver {
    consumer: rtrb::Consumer<MidiEvent>,
}

impl MidiReceiver {
    /// Take the oldest event, or `None` if the queue is empty (never blocks)
    #[inline]
    pub fn pop(&mut self) -> Option<MidiEvent> {
        self.consumer.pop().ok()
    }

    /// Number of queued events
    pub fn pending(&self) -> usize {
        self.consumer.slots()
    }
}

/// Create a MIDI channel whose capacity is `capacity` rounded up to a power of two
pub fn midi_channel(capacity: usize) -> (MidiSender, MidiReceiver) {
    let capacity = capacity.max(2).next_power_of_two();
    let (producer, consumer) = rtrb::RingBuffer::new(capacity);
    (MidiSender { producer }, MidiReceiver { consumer })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_and_receive() {
        let (mut tx, mut rx) = midi_channel(8);
        tx.send(MidiEvent::note_on(60, 0.8, 3)).unwrap();
        tx.send(MidiEvent::note_off(60, 0)).unwrap();

        let first = rx.pop().unwrap();
        assert_eq!(first.kind, MidiKind::NoteOn);
        assert_eq!(first.note, 60);
        assert_eq!(first.sample_offset, 3);
        assert_eq!(rx.pop().unwrap().kind, MidiKind::NoteOff);
        assert!(rx.pop().is_none());
    }

    #[test]
    fn test_capacity_rounds_to_power_of_two() {
        let (tx, _rx) = midi_channel(100);
        assert_eq!(tx.slots(), 128);
    }

    #[test]
    fn test_full_queue_rejects_without_corruption() {
        let (mut tx, mut rx) = midi_channel(4);
        for note in 0..4 {
            tx.send(MidiEvent::note_on(note, 1.0, 0)).unwrap();
        }
        let rejected = tx.send(MidiEvent::note_on(99, 1.0, 0)).unwrap_err();
        assert_eq!(rejected.note, 99);

        for note in 0..4u8 {
            assert_eq!(rx.pop().unwrap().note, note);
        }
        assert!(rx.pop().is_none());
    }

    #[test]
    fn test_event_clamping() {
        let event = MidiEvent::note_on(200, 3.0, 0);
        assert_eq!(event.note, 127);
        assert_eq!(event.velocity, 1.0);
        assert_eq!(MidiEvent::note_on(-5, f32::NAN, 0).velocity, 0.0);
        assert!(MidiEvent::note_on(60, 0.0, 0).is_release());
    }

    #[test]
    fn test_spsc_stress_no_loss_no_duplication() {
        const TOTAL: u32 = 100_000;
        let (mut tx, mut rx) = midi_channel(64);

        let producer = std::thread::spawn(move || {
            let mut next = 0u32;
            while next < TOTAL {
                let event = MidiEvent {
                    kind: MidiKind::NoteOn,
                    note: (next % 128) as u8,
                    velocity: 1.0,
                    sample_offset: next,
                };
                match tx.send(event) {
                    Ok(()) => next += 1,
                    Err(_) => std::thread::yield_now(),
                }
            }
        });

        let mut expected = 0u32;
        while expected < TOTAL {
            match rx.pop() {
                Some(event) => {
                    assert_eq!(event.sample_offset, expected, "event lost or duplicated");
                    assert_eq!(event.note, (expected % 128) as u8);
                    expected += 1;
                }
                None => std::thread::yield_now(),
            }
        }

        producer.join().unwrap();
        assert!(rx.pop().is_none());
    }
}
