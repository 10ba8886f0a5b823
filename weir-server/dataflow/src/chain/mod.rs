//! The operator chain: all operators of one task, executed on one thread.
//!
//! A chain is an arena of operators addressed by index. Each operator lists
//! its *targets*: either another operator in the same chain (an inlined
//! collector, no channel in between) or one of the task's network outputs.
//! Records are pushed through the arena with an explicit worklist, so there
//! is no recursive ownership between operators and no locking anywhere --
//! exactly one mailbox thread advances the chain.
//!
//! The chain doubles as the task's control path. Control markers are
//! broadcast to every outgoing network channel *in submission order relative
//! to queued records*: the underlying channels are FIFO, and the chain only
//! ever writes from its single thread, so a marker is a well-defined point in
//! each output stream.

use std::collections::VecDeque;
use std::collections::{HashMap, HashSet};
use std::fmt;

use rand::Rng;

use weir::channel::{SendError, Sender};
use weir::{
    CheckpointId, ExecutionAttemptId, InputChannelDescriptor, ModificationAction,
    ModificationMetadata,
};

use crate::payload::{
    CheckpointOptions, LatencyMarker, Marker, OutputTag, StreamMessage, StreamRecord,
    StreamStatus, Watermark,
};

/// Receives whatever an operator emits while processing one event.
pub trait Collector {
    /// Emit to the main output.
    fn collect(&mut self, record: StreamRecord);
    /// Emit to the side output identified by `tag`.
    fn collect_side(&mut self, tag: &OutputTag, record: StreamRecord);
    fn emit_watermark(&mut self, watermark: Watermark);
    fn emit_latency_marker(&mut self, marker: LatencyMarker);
}

/// A user operator, as seen by the chain.
pub trait StreamOperator: fmt::Debug {
    fn on_record(&mut self, record: StreamRecord, out: &mut dyn Collector);

    fn on_watermark(&mut self, watermark: Watermark, out: &mut dyn Collector) {
        out.emit_watermark(watermark);
    }

    fn on_latency_marker(&mut self, marker: LatencyMarker, out: &mut dyn Collector) {
        out.emit_latency_marker(marker);
    }
}

/// Where one output of an operator leads.
#[derive(Clone, Copy, Debug)]
enum TargetKind {
    /// Another operator in this chain.
    Chained(usize),
    /// One of the chain's network outputs.
    Network(usize),
}

#[derive(Debug)]
struct ChainTarget {
    destination: TargetKind,
    /// `None` makes this a main-output target; `Some` gates it on the
    /// matching side-output tag.
    tag: Option<OutputTag>,
}

struct ChainedOperator {
    name: String,
    operator: Box<dyn StreamOperator>,
    targets: Vec<ChainTarget>,
}

/// How records are spread over the channels of one network output.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Partitioner {
    /// Everything to channel 0; only valid for single-channel outputs.
    Forward,
    /// Every record to every channel.
    Broadcast,
    /// Round-robin over all channels.
    Rebalance,
}

/// One outgoing network edge: a writer with one FIFO channel per consuming
/// subtask.
pub struct RecordWriterOutput {
    name: String,
    partitioner: Partitioner,
    channels: Vec<Box<dyn Sender<Item = StreamMessage> + Send>>,
    next_channel: usize,
}

impl RecordWriterOutput {
    pub fn new(
        name: String,
        partitioner: Partitioner,
        channels: Vec<Box<dyn Sender<Item = StreamMessage> + Send>>,
    ) -> Self {
        assert!(!channels.is_empty(), "output {} has no channels", name);
        RecordWriterOutput {
            name,
            partitioner,
            channels,
            next_channel: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    fn send_record(&mut self, record: StreamRecord) -> Result<(), SendError> {
        match self.partitioner {
            Partitioner::Forward => self.channels[0].send(StreamMessage::Record(record)),
            Partitioner::Rebalance => {
                let i = self.next_channel;
                self.next_channel = (i + 1) % self.channels.len();
                self.channels[i].send(StreamMessage::Record(record))
            }
            Partitioner::Broadcast => {
                let last = self.channels.len() - 1;
                for channel in &mut self.channels[..last] {
                    channel.send(StreamMessage::Record(record.clone()))?;
                }
                // don't copy for the last channel
                self.channels[last].send(StreamMessage::Record(record))
            }
        }
    }

    /// Write `msg` to every channel, after anything already submitted.
    fn broadcast(&mut self, msg: StreamMessage) -> Result<(), SendError> {
        for channel in &mut self.channels {
            channel.send(msg.clone())?;
        }
        Ok(())
    }

    fn send_to_channel(&mut self, i: usize, msg: StreamMessage) -> Result<(), SendError> {
        self.channels[i].send(msg)
    }
}

/// Errors escalated to the task's failure handler.
#[derive(Debug, Fail)]
pub enum ChainError {
    #[fail(display = "broadcast on output {} failed: {}", output, cause)]
    Broadcast {
        output: String,
        #[cause]
        cause: SendError,
    },
    #[fail(
        display = "output {} has {} channels, but {} replacement channel descriptors were given",
        output, channels, descriptors
    )]
    ChannelCountMismatch {
        output: String,
        channels: usize,
        descriptors: usize,
    },
    #[fail(display = "chain target references unknown operator {}", _0)]
    UnknownOperator(usize),
    #[fail(display = "chain target references unknown output {}", _0)]
    UnknownOutput(usize),
}

/// What one operator produced while processing a single event.
#[derive(Default)]
struct EmissionBuffer {
    emissions: Vec<Emission>,
}

enum Emission {
    Record(Option<OutputTag>, StreamRecord),
    Watermark(Watermark),
    Latency(LatencyMarker),
}

impl Collector for EmissionBuffer {
    fn collect(&mut self, record: StreamRecord) {
        self.emissions.push(Emission::Record(None, record));
    }

    fn collect_side(&mut self, tag: &OutputTag, record: StreamRecord) {
        self.emissions.push(Emission::Record(Some(tag.clone()), record));
    }

    fn emit_watermark(&mut self, watermark: Watermark) {
        self.emissions.push(Emission::Watermark(watermark));
    }

    fn emit_latency_marker(&mut self, marker: LatencyMarker) {
        self.emissions.push(Emission::Latency(marker));
    }
}

/// An event on its way to one operator of the chain.
enum Delivery {
    Record(StreamRecord),
    Watermark(Watermark),
    Latency(LatencyMarker),
}

/// Assembles an [`OperatorChain`].
pub struct OperatorChainBuilder {
    name: String,
    object_reuse: bool,
    operators: Vec<ChainedOperator>,
    outputs: Vec<RecordWriterOutput>,
    log: slog::Logger,
}

impl OperatorChainBuilder {
    pub fn new<S: ToString>(name: S, log: slog::Logger) -> Self {
        OperatorChainBuilder {
            name: name.to_string(),
            object_reuse: false,
            operators: Vec::new(),
            outputs: Vec::new(),
            log,
        }
    }

    /// Enable object reuse: records handed to chained operators are not
    /// defensively copied first.
    pub fn object_reuse(mut self, enabled: bool) -> Self {
        self.object_reuse = enabled;
        self
    }

    /// Add an operator to the chain. The first operator added is the head.
    pub fn operator<S: ToString>(mut self, name: S, operator: Box<dyn StreamOperator>) -> Self {
        self.operators.push(ChainedOperator {
            name: name.to_string(),
            operator,
            targets: Vec::new(),
        });
        self
    }

    /// Wire operator `from`'s output into operator `to`, optionally gated on
    /// a side-output tag.
    pub fn chain(mut self, from: usize, to: usize, tag: Option<OutputTag>) -> Self {
        self.operators[from].targets.push(ChainTarget {
            destination: TargetKind::Chained(to),
            tag,
        });
        self
    }

    /// Add a network output, wired to operator `from`'s main output.
    pub fn output(mut self, from: usize, output: RecordWriterOutput) -> Self {
        let idx = self.outputs.len();
        self.outputs.push(output);
        self.operators[from].targets.push(ChainTarget {
            destination: TargetKind::Network(idx),
            tag: None,
        });
        self
    }

    pub fn build(self) -> Result<OperatorChain, ChainError> {
        for op in &self.operators {
            for target in &op.targets {
                match target.destination {
                    TargetKind::Chained(i) if i >= self.operators.len() => {
                        return Err(ChainError::UnknownOperator(i));
                    }
                    TargetKind::Network(i) if i >= self.outputs.len() => {
                        return Err(ChainError::UnknownOutput(i));
                    }
                    _ => (),
                }
            }
        }

        debug!(self.log, "assembled operator chain";
               "task" => &self.name,
               "operators" => self.operators.len(),
               "outputs" => self.outputs.len());

        Ok(OperatorChain {
            name: self.name,
            object_reuse: self.object_reuse,
            operators: self.operators,
            outputs: self.outputs,
            stream_status: StreamStatus::Active,
            log: self.log,
        })
    }
}

/// All operators executed as one chain within a single task.
pub struct OperatorChain {
    name: String,
    object_reuse: bool,
    operators: Vec<ChainedOperator>,
    outputs: Vec<RecordWriterOutput>,
    /// Current status of the chain's input stream. Watermarks generated by
    /// operators in the chain are blocked while this is `Idle`.
    stream_status: StreamStatus,
    log: slog::Logger,
}

impl OperatorChain {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn chain_length(&self) -> usize {
        self.operators.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    pub fn stream_status(&self) -> StreamStatus {
        self.stream_status
    }

    /// Change the chain's stream status and forward the change to all
    /// outgoing connections. No-op if the status is unchanged.
    pub fn toggle_stream_status(&mut self, status: StreamStatus) -> Result<(), ChainError> {
        if status == self.stream_status {
            return Ok(());
        }
        self.stream_status = status;
        for i in 0..self.outputs.len() {
            self.broadcast_on(i, StreamMessage::StatusChange(status))?;
        }
        Ok(())
    }

    /// Feed one record to the head operator and run it through the chain.
    pub fn process_record(&mut self, record: StreamRecord) -> Result<(), ChainError> {
        self.run(Delivery::Record(record))
    }

    /// Feed a watermark to the head operator.
    pub fn process_watermark(&mut self, watermark: Watermark) -> Result<(), ChainError> {
        self.run(Delivery::Watermark(watermark))
    }

    /// Feed a latency probe to the head operator.
    pub fn process_latency_marker(&mut self, marker: LatencyMarker) -> Result<(), ChainError> {
        self.run(Delivery::Latency(marker))
    }

    fn run(&mut self, first: Delivery) -> Result<(), ChainError> {
        let mut worklist = VecDeque::new();
        worklist.push_back((0, first));

        while let Some((op, delivery)) = worklist.pop_front() {
            let mut buffer = EmissionBuffer::default();
            {
                let chained = &mut self.operators[op];
                match delivery {
                    Delivery::Record(r) => chained.operator.on_record(r, &mut buffer),
                    Delivery::Watermark(wm) => chained.operator.on_watermark(wm, &mut buffer),
                    Delivery::Latency(m) => chained.operator.on_latency_marker(m, &mut buffer),
                }
            }
            self.route(op, buffer, &mut worklist)?;
        }
        Ok(())
    }

    fn route(
        &mut self,
        from: usize,
        buffer: EmissionBuffer,
        worklist: &mut VecDeque<(usize, Delivery)>,
    ) -> Result<(), ChainError> {
        for emission in buffer.emissions {
            match emission {
                Emission::Record(tag, record) => {
                    let matching: Vec<usize> = self.operators[from]
                        .targets
                        .iter()
                        .enumerate()
                        .filter(|&(_, t)| t.tag == tag)
                        .map(|(i, _)| i)
                        .collect();
                    if matching.is_empty() {
                        continue;
                    }

                    // shallow-copy for all targets but the last; the last one
                    // gets the original
                    let last = *matching.last().unwrap();
                    for &t in &matching[..matching.len() - 1] {
                        self.deliver(from, t, record.clone(), worklist)?;
                    }
                    self.deliver(from, last, record, worklist)?;
                }
                Emission::Watermark(wm) => {
                    if !self.stream_status.is_active() {
                        continue;
                    }
                    for t in 0..self.operators[from].targets.len() {
                        let destination = self.operators[from].targets[t].destination;
                        match destination {
                            TargetKind::Chained(op) => {
                                worklist.push_back((op, Delivery::Watermark(wm)));
                            }
                            TargetKind::Network(out) => {
                                self.broadcast_on(out, StreamMessage::Watermark(wm))?;
                            }
                        }
                    }
                }
                Emission::Latency(marker) => {
                    // forward along exactly one path so fan-out does not
                    // multiply the probe
                    let ntargets = self.operators[from].targets.len();
                    if ntargets == 0 {
                        continue;
                    }
                    let pick = if ntargets == 1 {
                        0
                    } else {
                        rand::thread_rng().gen_range(0, ntargets)
                    };
                    let destination = self.operators[from].targets[pick].destination;
                    match destination {
                        TargetKind::Chained(op) => {
                            worklist.push_back((op, Delivery::Latency(marker)));
                        }
                        TargetKind::Network(out) => {
                            let nchannels = self.outputs[out].num_channels();
                            let channel = if nchannels == 1 {
                                0
                            } else {
                                rand::thread_rng().gen_range(0, nchannels)
                            };
                            let name = self.outputs[out].name().to_owned();
                            self.outputs[out]
                                .send_to_channel(channel, StreamMessage::LatencyMarker(marker))
                                .map_err(|cause| ChainError::Broadcast {
                                    output: name,
                                    cause,
                                })?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn deliver(
        &mut self,
        from: usize,
        target: usize,
        record: StreamRecord,
        worklist: &mut VecDeque<(usize, Delivery)>,
    ) -> Result<(), ChainError> {
        let destination = self.operators[from].targets[target].destination;
        match destination {
            TargetKind::Chained(op) => {
                // without object reuse the chained operator gets its own copy,
                // matching what a serializing collector would hand it
                let record = if self.object_reuse {
                    record
                } else {
                    record.clone()
                };
                worklist.push_back((op, Delivery::Record(record)));
            }
            TargetKind::Network(out) => {
                let name = self.outputs[out].name().to_owned();
                self.outputs[out]
                    .send_record(record)
                    .map_err(|cause| ChainError::Broadcast {
                        output: name,
                        cause,
                    })?;
            }
        }
        Ok(())
    }

    fn broadcast_on(&mut self, output: usize, msg: StreamMessage) -> Result<(), ChainError> {
        let name = self.outputs[output].name().to_owned();
        self.outputs[output]
            .broadcast(msg)
            .map_err(|cause| ChainError::Broadcast {
                output: name,
                cause,
            })
    }

    fn broadcast_marker(&mut self, marker: Marker) -> Result<(), ChainError> {
        for i in 0..self.outputs.len() {
            self.broadcast_on(i, StreamMessage::Marker(marker.clone()))?;
        }
        Ok(())
    }

    pub fn broadcast_checkpoint_barrier(
        &mut self,
        id: CheckpointId,
        timestamp: u64,
        options: CheckpointOptions,
    ) -> Result<(), ChainError> {
        self.broadcast_marker(Marker::CheckpointBarrier {
            id,
            timestamp,
            options,
        })
    }

    pub fn broadcast_checkpoint_cancel_marker(&mut self, id: CheckpointId) -> Result<(), ChainError> {
        self.broadcast_marker(Marker::CancelCheckpoint { id })
    }

    pub fn broadcast_start_modification_event(
        &mut self,
        metadata: ModificationMetadata,
        acks: HashSet<ExecutionAttemptId>,
        subtasks_to_pause: HashSet<usize>,
        action: ModificationAction,
    ) -> Result<(), ChainError> {
        debug!(self.log, "broadcasting start-modification";
               "task" => &self.name,
               "modification" => %metadata.modification,
               "action" => %action);
        self.broadcast_marker(Marker::StartModification {
            metadata,
            acks,
            subtasks_to_pause,
            action,
        })
    }

    pub fn broadcast_start_migration_event(
        &mut self,
        metadata: ModificationMetadata,
        spilling: HashMap<ExecutionAttemptId, HashSet<usize>>,
        stopping: HashMap<ExecutionAttemptId, Vec<InputChannelDescriptor>>,
        upcoming_checkpoint: Option<CheckpointId>,
    ) -> Result<(), ChainError> {
        debug!(self.log, "broadcasting start-migration";
               "task" => &self.name,
               "modification" => %metadata.modification,
               "spilling" => spilling.len(),
               "stopping" => stopping.len());
        self.broadcast_marker(Marker::StartMigration {
            metadata,
            spilling,
            stopping,
            upcoming_checkpoint,
        })
    }

    pub fn broadcast_cancel_modification_event(
        &mut self,
        metadata: ModificationMetadata,
        vertices: HashSet<ExecutionAttemptId>,
    ) -> Result<(), ChainError> {
        debug!(self.log, "broadcasting cancel-modification";
               "task" => &self.name,
               "modification" => %metadata.modification);
        self.broadcast_marker(Marker::CancelModification { metadata, vertices })
    }

    /// Fan the replacement input-channel descriptors of a paused operator out
    /// to its consumers: the i-th descriptor goes to the i-th channel of each
    /// output (this is deliberately *not* a broadcast).
    ///
    /// Nothing is emitted unless every output's channel count matches the
    /// descriptor count.
    pub fn broadcast_operator_paused_event(
        &mut self,
        descriptors: Vec<InputChannelDescriptor>,
    ) -> Result<(), ChainError> {
        for output in &self.outputs {
            if output.num_channels() != descriptors.len() {
                return Err(ChainError::ChannelCountMismatch {
                    output: output.name().to_owned(),
                    channels: output.num_channels(),
                    descriptors: descriptors.len(),
                });
            }
        }

        for output in &mut self.outputs {
            for (i, descriptor) in descriptors.iter().enumerate() {
                output
                    .send_to_channel(
                        i,
                        StreamMessage::Marker(Marker::OperatorPaused {
                            descriptor: *descriptor,
                        }),
                    )
                    .map_err(|cause| ChainError::Broadcast {
                        output: output.name.clone(),
                        cause,
                    })?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for OperatorChain {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "OperatorChain({}, {} operators, {} outputs, {:?})",
            self.name,
            self.operators.len(),
            self.outputs.len(),
            self.stream_status
        )
    }
}
