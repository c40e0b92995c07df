use chrono::Utc;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::app::{
    self, flags, iin1, iin2, AppControl, Control, ControlHeader, ControlItem, FunctionCode, Iin,
    Range, Request, ResponseWriter, MAX_RESPONSE_FRAGMENT,
};
use super::events::{ChangeDetector, Event, EventBuffer, EventClass, EventValue, Report};
use super::link::{self, function as link_fn, LinkFrame, LinkParse};
use super::transport::{self, Reassembler};
use super::ControlStatus;
use crate::config::Dnp3Config;
use crate::domain::{Command, CommandOrigin};
use crate::events::{EventBus, GatewayEvent, SessionProtocol};
use crate::points::Dnp3PointType;
use crate::router::CommandRouter;
use crate::scan::{Snapshot, SnapshotStore};

const READ_CHUNK: usize = 1024;

/// Events reported in one response, sized so they fit the first fragment
const MAX_EVENTS_PER_RESPONSE: usize = 280;

/// Class 0 content, in response order
const STATIC_OBJECTS: [(u8, u8, Dnp3PointType); 4] = [
    (1, 2, Dnp3PointType::BinaryInput),
    (10, 2, Dnp3PointType::BinaryOutput),
    (30, 5, Dnp3PointType::AnalogInput),
    (40, 3, Dnp3PointType::AnalogOutput),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, link not yet reset and no request seen
    Idle,
    Online,
    Closed,
}

#[derive(Debug)]
struct Selection {
    seq: u8,
    objects: Vec<u8>,
    at: Instant,
}

#[derive(Debug, Default)]
struct Unsolicited {
    class1: bool,
    class2: bool,
    /// The startup null response has been confirmed
    started: bool,
    outstanding: Option<(u8, Instant)>,
    seq: u8,
}

/// Protocol state of one master connection.
///
/// Every input returns the bytes to write back, so the session can be driven
/// without a socket.
pub struct Session {
    config: Dnp3Config,
    router: Arc<CommandRouter>,
    store: SnapshotStore,
    restart: Arc<AtomicBool>,
    state: SessionState,
    link_reset: bool,
    expected_fcb: bool,
    reassembler: Reassembler,
    transport_seq: u8,
    selection: Option<Selection>,
    buffer: EventBuffer,
    detector: ChangeDetector,
    solicited: Option<(u8, Instant)>,
    /// Fragments of the current response still waiting for a confirm
    continuation: VecDeque<Vec<u8>>,
    unsolicited: Unsolicited,
    broadcast_seen: bool,
}

impl Session {
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn pending_events(&self) -> usize {
        self.buffer.len()
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closed;
        self.selection = None;
        self.continuation.clear();
        self.reassembler.reset();
    }

    /// Earliest confirm deadline the caller should wake up for
    pub fn next_deadline(&self) -> Option<Instant> {
        [self.solicited, self.unsolicited.outstanding]
            .into_iter()
            .flatten()
            .map(|(_, deadline)| deadline)
            .min()
    }

    pub fn on_frame(&mut self, frame: LinkFrame, snapshot: &Snapshot, now: Instant) -> Vec<u8> {
        let mut out = Vec::new();
        if self.state == SessionState::Closed {
            return out;
        }
        if frame.source != self.config.remote_address {
            trace!(source = frame.source, "frame from unexpected master dropped");
            return out;
        }
        let broadcast = frame.is_broadcast();
        if frame.destination != self.config.local_address && !broadcast {
            trace!(destination = frame.destination, "frame for another station dropped");
            return out;
        }
        if !frame.is_primary() {
            return out;
        }

        let (reply, deliver) = match frame.function() {
            link_fn::RESET_LINK_STATES => {
                self.link_reset = true;
                self.expected_fcb = true;
                self.reassembler.reset();
                (Some(link_fn::ACK), false)
            }
            link_fn::TEST_LINK_STATES if !self.link_reset => (Some(link_fn::NACK), false),
            link_fn::TEST_LINK_STATES => {
                if frame.fcb() == self.expected_fcb {
                    self.expected_fcb = !self.expected_fcb;
                }
                (Some(link_fn::ACK), false)
            }
            link_fn::CONFIRMED_USER_DATA if !self.link_reset => (Some(link_fn::NACK), false),
            link_fn::CONFIRMED_USER_DATA => {
                let fresh = frame.fcb() == self.expected_fcb;
                if fresh {
                    self.expected_fcb = !self.expected_fcb;
                } else {
                    trace!("repeated frame acknowledged again");
                }
                (Some(link_fn::ACK), fresh)
            }
            link_fn::UNCONFIRMED_USER_DATA => (None, true),
            link_fn::REQUEST_LINK_STATUS => (Some(link_fn::LINK_STATUS), false),
            other => {
                debug!(function = other, "unsupported link function");
                (Some(link_fn::NOT_SUPPORTED), false)
            }
        };

        if let Some(function) = reply {
            if !broadcast {
                out.extend(self.secondary(function));
            }
        }
        if frame.function() == link_fn::RESET_LINK_STATES && self.state == SessionState::Idle {
            self.state = SessionState::Online;
            self.start_unsolicited(now, &mut out);
        }
        if deliver {
            self.user_data(&frame.data, broadcast, snapshot, now, &mut out);
        }
        out
    }

    /// Raise events for a newly committed snapshot of the session's epoch
    pub fn on_snapshot(&mut self, snapshot: &Snapshot, now: Instant) -> Vec<u8> {
        let mut out = Vec::new();
        if self.state == SessionState::Closed {
            return out;
        }
        let raised = self.detector.scan(snapshot, &mut self.buffer);
        if raised > 0 {
            trace!(raised, pending = self.buffer.len(), "events raised");
            self.try_unsolicited(now, &mut out);
        }
        out
    }

    /// Expire unanswered confirmations
    pub fn on_timer(&mut self, now: Instant) -> Vec<u8> {
        let mut out = Vec::new();
        if let Some((_, deadline)) = self.solicited {
            if now >= deadline {
                debug!(dropped = self.continuation.len(), "solicited confirm timed out");
                self.solicited = None;
                self.continuation.clear();
                self.buffer.unmark(Report::Solicited);
            }
        }
        if let Some((_, deadline)) = self.unsolicited.outstanding {
            if now >= deadline {
                debug!("unsolicited confirm timed out");
                self.unsolicited.outstanding = None;
                self.buffer.unmark(Report::Unsolicited);
                // the startup response is retried until confirmed
                self.start_unsolicited(now, &mut out);
            }
        }
        out
    }

    fn secondary(&self, function: u8) -> Vec<u8> {
        LinkFrame::new(
            function,
            self.config.remote_address,
            self.config.local_address,
            Vec::new(),
        )
        .encode()
    }

    fn send_fragment(&mut self, fragment: &[u8], out: &mut Vec<u8>) {
        let (segments, next) = transport::segment(fragment, self.transport_seq);
        self.transport_seq = next;
        for segment in segments {
            let frame = LinkFrame::new(
                link::PRM | link_fn::UNCONFIRMED_USER_DATA,
                self.config.remote_address,
                self.config.local_address,
                segment,
            );
            out.extend(frame.encode());
        }
    }

    fn user_data(
        &mut self,
        segment: &[u8],
        broadcast: bool,
        snapshot: &Snapshot,
        now: Instant,
        out: &mut Vec<u8>,
    ) {
        let Some(fragment) = self.reassembler.push(segment) else {
            return;
        };
        let request = match app::parse_request(&fragment) {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "unparseable application fragment");
                return;
            }
        };

        if request.function == FunctionCode::Confirm as u8 {
            self.confirm(request.control, now, out);
            return;
        }

        let was_idle = self.state == SessionState::Idle;
        if was_idle {
            self.state = SessionState::Online;
        }
        // any request abandons the rest of the previous response
        self.continuation.clear();
        if let Some(fragments) = self.handle_request(request, broadcast, snapshot, now) {
            if fragments.len() > 1 {
                debug!(fragments = fragments.len(), "response split into fragments");
            }
            self.continuation = fragments.into();
            self.send_next(now, out);
        }
        if was_idle {
            self.start_unsolicited(now, out);
        }
    }

    /// Send the next queued response fragment, arming a confirm when it asks for one
    fn send_next(&mut self, now: Instant, out: &mut Vec<u8>) {
        let Some(fragment) = self.continuation.pop_front() else {
            return;
        };
        if let Some(control) = fragment.first().copied().map(AppControl::parse) {
            if control.con {
                self.solicited = Some((control.seq, now + confirm_timeout(&self.config)));
            }
        }
        self.send_fragment(&fragment, out);
    }

    fn handle_request(
        &mut self,
        request: Request<'_>,
        broadcast: bool,
        snapshot: &Snapshot,
        now: Instant,
    ) -> Option<Vec<Vec<u8>>> {
        let Request {
            control,
            function,
            objects,
        } = request;
        if !(control.fir && control.fin) {
            debug!("multi-fragment request dropped");
            return None;
        }

        // a selection only arms the request that immediately follows it
        let selection = self.selection.take();
        let mut iin = Iin::default();
        let mut writer = ResponseWriter::new(AppControl::response(control.seq), FunctionCode::Response);

        match FunctionCode::from_u8(function) {
            Some(FunctionCode::Read) => self.read(objects, snapshot, &mut writer, &mut iin),
            Some(FunctionCode::Write) => self.write(objects, &mut iin),
            Some(FunctionCode::Select) => {
                self.select(control.seq, objects, snapshot, &mut writer, &mut iin, now)
            }
            Some(FunctionCode::Operate) => {
                if let Some(headers) = parse_controls(objects, &mut iin) {
                    let statuses =
                        self.operate(control.seq, objects, selection, &headers, snapshot, now);
                    writer.control_echo(&headers, &statuses);
                }
            }
            Some(FunctionCode::DirectOperate) => {
                if let Some(headers) = parse_controls(objects, &mut iin) {
                    let statuses = self.execute(&headers, snapshot);
                    writer.control_echo(&headers, &statuses);
                }
            }
            Some(FunctionCode::DirectOperateNoResponse) => {
                if let Some(headers) = parse_controls(objects, &mut iin) {
                    self.execute(&headers, snapshot);
                }
                return None;
            }
            Some(FunctionCode::EnableUnsolicited) => self.unsolicited_mask(objects, true, &mut iin),
            Some(FunctionCode::DisableUnsolicited) => self.unsolicited_mask(objects, false, &mut iin),
            _ => {
                debug!(function, "unsupported application function");
                iin.iin2 |= iin2::NO_FUNC_CODE_SUPPORT;
            }
        }

        if broadcast {
            self.broadcast_seen = true;
            return None;
        }
        iin |= self.device_iin();
        writer.set_iin(iin);
        Some(writer.into_fragments(MAX_RESPONSE_FRAGMENT))
    }

    fn device_iin(&mut self) -> Iin {
        let mut iin = Iin::default();
        if std::mem::take(&mut self.broadcast_seen) {
            iin.iin1 |= iin1::ALL_STATIONS;
        }
        if self.restart.load(Ordering::Acquire) {
            iin.iin1 |= iin1::DEVICE_RESTART;
        }
        if self.store.is_stalled() {
            iin.iin1 |= iin1::DEVICE_TROUBLE;
        }
        if self.buffer.has(EventClass::One) {
            iin.iin1 |= iin1::CLASS_1_EVENTS;
        }
        if self.buffer.has(EventClass::Two) {
            iin.iin1 |= iin1::CLASS_2_EVENTS;
        }
        if self.buffer.overflowed() {
            iin.iin2 |= iin2::EVENT_BUFFER_OVERFLOW;
        }
        iin
    }

    fn confirm(&mut self, control: AppControl, now: Instant, out: &mut Vec<u8>) {
        if control.uns {
            match self.unsolicited.outstanding {
                Some((seq, _)) if seq == control.seq => {
                    self.unsolicited.outstanding = None;
                    self.unsolicited.started = true;
                    let cleared = self.buffer.confirm(Report::Unsolicited);
                    trace!(cleared, "unsolicited response confirmed");
                    self.try_unsolicited(now, out);
                }
                _ => trace!(seq = control.seq, "unexpected unsolicited confirm"),
            }
        } else {
            match self.solicited {
                Some((seq, _)) if seq == control.seq => {
                    self.solicited = None;
                    let cleared = self.buffer.confirm(Report::Solicited);
                    trace!(cleared, remaining = self.continuation.len(), "solicited response confirmed");
                    self.send_next(now, out);
                }
                _ => trace!(seq = control.seq, "unexpected confirm"),
            }
        }
    }

    /// Event headers are answered before static data so that reported events
    /// always travel in the first fragment.
    fn read(&mut self, objects: &[u8], snapshot: &Snapshot, writer: &mut ResponseWriter, iin: &mut Iin) {
        let headers = match app::parse_headers(objects) {
            Ok(headers) => headers,
            Err(e) => {
                debug!(error = %e, "malformed read");
                *iin |= Iin::from_decode_error(&e);
                return;
            }
        };

        // a new read supersedes the previous unconfirmed response
        self.buffer.unmark(Report::Solicited);
        self.solicited = None;

        let mut budget = MAX_EVENTS_PER_RESPONSE;
        for header in &headers {
            let class = match (header.group, header.variation) {
                (60, 2) | (2, 0) | (2, 1) => EventClass::One,
                (60, 3) | (32, 0) | (32, 5) => EventClass::Two,
                _ => continue,
            };
            budget -= self.write_events(class, &header.range, budget, writer, iin);
        }
        if budget < MAX_EVENTS_PER_RESPONSE {
            writer.request_confirm();
        }

        for header in &headers {
            let range = &header.range;
            match (header.group, header.variation) {
                (60, 2) | (2, 0) | (2, 1) | (60, 3) | (32, 0) | (32, 5) => {}
                (60, 1) => {
                    if *range != Range::All {
                        iin.iin2 |= iin2::PARAMETER_ERROR;
                        continue;
                    }
                    for (group, variation, point_type) in STATIC_OBJECTS {
                        write_static(snapshot, writer, iin, group, variation, point_type, range);
                    }
                }
                // no class 3 points are configured
                (60, 4) => {}
                (1, 0) | (1, 2) => {
                    write_static(snapshot, writer, iin, 1, 2, Dnp3PointType::BinaryInput, range)
                }
                (10, 0) | (10, 2) => {
                    write_static(snapshot, writer, iin, 10, 2, Dnp3PointType::BinaryOutput, range)
                }
                (30, 0) | (30, 5) => {
                    write_static(snapshot, writer, iin, 30, 5, Dnp3PointType::AnalogInput, range)
                }
                (30, 1) => write_static(snapshot, writer, iin, 30, 1, Dnp3PointType::AnalogInput, range),
                (40, 0) | (40, 3) => {
                    write_static(snapshot, writer, iin, 40, 3, Dnp3PointType::AnalogOutput, range)
                }
                (40, 1) => write_static(snapshot, writer, iin, 40, 1, Dnp3PointType::AnalogOutput, range),
                (group, variation) => {
                    debug!(group, variation, "unsupported object in read");
                    iin.iin2 |= iin2::OBJECT_UNKNOWN;
                }
            }
        }
    }

    /// Number of events written, at most `budget`
    fn write_events(
        &mut self,
        class: EventClass,
        range: &Range,
        budget: usize,
        writer: &mut ResponseWriter,
        iin: &mut Iin,
    ) -> usize {
        let limit = match range {
            Range::All => budget,
            Range::Count(n) => usize::from(*n).min(budget),
            _ => {
                iin.iin2 |= iin2::PARAMETER_ERROR;
                return 0;
            }
        };
        let events = self.buffer.select(class, Some(limit), Report::Solicited);
        write_event_objects(writer, class, &events);
        events.len()
    }

    fn write(&mut self, objects: &[u8], iin: &mut Iin) {
        match app::parse_iin_write(objects) {
            Ok(bits) => {
                for (index, value) in bits {
                    if index == 7 && !value {
                        if self.restart.swap(false, Ordering::AcqRel) {
                            info!("device restart indication cleared");
                        }
                    } else {
                        iin.iin2 |= iin2::PARAMETER_ERROR;
                    }
                }
            }
            Err(e) => {
                debug!(error = %e, "unsupported write");
                *iin |= Iin::from_decode_error(&e);
            }
        }
    }

    fn select(
        &mut self,
        seq: u8,
        objects: &[u8],
        snapshot: &Snapshot,
        writer: &mut ResponseWriter,
        iin: &mut Iin,
        now: Instant,
    ) {
        let Some(headers) = parse_controls(objects, iin) else {
            return;
        };
        let statuses: Vec<ControlStatus> = items(&headers)
            .map(|item| {
                control_command(item, snapshot)
                    .and_then(|command| {
                        self.router
                            .validate(&command)
                            .map_err(|e| ControlStatus::from(&e))
                    })
                    .err()
                    .unwrap_or(ControlStatus::Success)
            })
            .collect();

        if statuses.iter().all(|s| *s == ControlStatus::Success) {
            self.selection = Some(Selection {
                seq,
                objects: objects.to_vec(),
                at: now,
            });
        }
        writer.control_echo(&headers, &statuses);
    }

    fn operate(
        &self,
        seq: u8,
        objects: &[u8],
        selection: Option<Selection>,
        headers: &[ControlHeader],
        snapshot: &Snapshot,
        now: Instant,
    ) -> Vec<ControlStatus> {
        let count = items(headers).count();
        match selection {
            Some(selected) if selected.objects == objects && app::next_seq(selected.seq) == seq => {
                let timeout = Duration::from_millis(self.config.select_timeout_ms);
                if now.duration_since(selected.at) > timeout {
                    debug!("operate after select timeout");
                    vec![ControlStatus::Timeout; count]
                } else {
                    self.execute(headers, snapshot)
                }
            }
            _ => vec![ControlStatus::NoSelect; count],
        }
    }

    fn execute(&self, headers: &[ControlHeader], snapshot: &Snapshot) -> Vec<ControlStatus> {
        items(headers)
            .map(|item| {
                let submitted = control_command(item, snapshot).and_then(|command| {
                    self.router
                        .submit(command, CommandOrigin::Dnp3)
                        .map_err(|e| ControlStatus::from(&e))
                });
                match submitted {
                    Ok(receipt) => {
                        debug!(index = item.index, target = %receipt.target, "control accepted");
                        ControlStatus::Success
                    }
                    Err(status) => status,
                }
            })
            .collect()
    }

    fn unsolicited_mask(&mut self, objects: &[u8], enable: bool, iin: &mut Iin) {
        if !self.config.unsolicited {
            iin.iin2 |= iin2::NO_FUNC_CODE_SUPPORT;
            return;
        }
        let headers = match app::parse_headers(objects) {
            Ok(headers) => headers,
            Err(e) => {
                *iin |= Iin::from_decode_error(&e);
                return;
            }
        };
        for header in headers {
            match (header.group, header.variation) {
                (60, 2) => self.unsolicited.class1 = enable,
                (60, 3) => self.unsolicited.class2 = enable,
                (60, 4) => {}
                _ => iin.iin2 |= iin2::OBJECT_UNKNOWN,
            }
        }
        debug!(
            class1 = self.unsolicited.class1,
            class2 = self.unsolicited.class2,
            "unsolicited classes updated"
        );
    }

    /// Null unsolicited response announcing the outstation after it comes online
    fn start_unsolicited(&mut self, now: Instant, out: &mut Vec<u8>) {
        if !self.config.unsolicited
            || self.unsolicited.started
            || self.unsolicited.outstanding.is_some()
            || self.state != SessionState::Online
        {
            return;
        }
        let seq = self.unsolicited.seq;
        let mut writer = ResponseWriter::new(AppControl::unsolicited(seq), FunctionCode::UnsolicitedResponse);
        let iin = self.device_iin();
        writer.set_iin(iin);
        self.unsolicited.outstanding = Some((seq, now + confirm_timeout(&self.config)));
        self.unsolicited.seq = app::next_seq(seq);
        self.send_fragment(&writer.finish(), out);
    }

    fn try_unsolicited(&mut self, now: Instant, out: &mut Vec<u8>) {
        if !self.config.unsolicited
            || !self.unsolicited.started
            || self.unsolicited.outstanding.is_some()
            || self.state != SessionState::Online
        {
            return;
        }
        let classes = [
            (EventClass::One, self.unsolicited.class1),
            (EventClass::Two, self.unsolicited.class2),
        ];
        if !classes
            .iter()
            .any(|&(class, enabled)| enabled && self.buffer.has_unreported(class))
        {
            return;
        }

        let seq = self.unsolicited.seq;
        let mut writer = ResponseWriter::new(AppControl::unsolicited(seq), FunctionCode::UnsolicitedResponse);
        let mut budget = MAX_EVENTS_PER_RESPONSE;
        for (class, enabled) in classes {
            if enabled {
                let events = self.buffer.select(class, Some(budget), Report::Unsolicited);
                budget -= events.len();
                write_event_objects(&mut writer, class, &events);
            }
        }
        let iin = self.device_iin();
        writer.set_iin(iin);
        self.unsolicited.outstanding = Some((seq, now + confirm_timeout(&self.config)));
        self.unsolicited.seq = app::next_seq(seq);
        self.send_fragment(&writer.finish(), out);
    }
}

fn confirm_timeout(config: &Dnp3Config) -> Duration {
    Duration::from_millis(config.confirm_timeout_ms)
}

fn items(headers: &[ControlHeader]) -> impl Iterator<Item = &ControlItem> {
    headers.iter().flat_map(|h| h.items.iter())
}

fn parse_controls(objects: &[u8], iin: &mut Iin) -> Option<Vec<ControlHeader>> {
    match app::parse_controls(objects) {
        Ok(headers) => Some(headers),
        Err(e) => {
            debug!(error = %e, "malformed control request");
            *iin |= Iin::from_decode_error(&e);
            None
        }
    }
}

fn control_command(item: &ControlItem, snapshot: &Snapshot) -> Result<Command, ControlStatus> {
    let point_type = match item.control {
        Control::Crob(_) => Dnp3PointType::BinaryOutput,
        Control::Analog(_) => Dnp3PointType::AnalogOutput,
    };
    let entry = snapshot
        .map
        .dnp3_point(point_type, item.index)
        .and_then(|e| snapshot.map.entry(e))
        .ok_or(ControlStatus::NotSupported)?;
    let command = match item.control {
        Control::Crob(crob) => entry.binary_command(crob.breaker_closed()?),
        Control::Analog(value) => entry.analog_command(value),
    };
    command.map_err(|e| ControlStatus::from(&e))
}

fn write_static(
    snapshot: &Snapshot,
    writer: &mut ResponseWriter,
    iin: &mut Iin,
    group: u8,
    variation: u8,
    point_type: Dnp3PointType,
    range: &Range,
) {
    let points = snapshot.map.dnp3_points(point_type);
    let count = points.len();
    if count == 0 {
        if !matches!(range, Range::All) {
            iin.iin2 |= iin2::PARAMETER_ERROR;
        }
        return;
    }
    let last = (count - 1) as u16;

    let (start, stop) = match range {
        Range::All => (0, last),
        Range::Count(0) => return,
        Range::Count(n) => (0, (*n - 1).min(last)),
        Range::StartStop { start, stop } => {
            if *start > last {
                iin.iin2 |= iin2::PARAMETER_ERROR;
                return;
            }
            if *stop > last {
                iin.iin2 |= iin2::PARAMETER_ERROR;
            }
            (*start, (*stop).min(last))
        }
        Range::Indices(indices) => {
            let valid: Vec<u16> = indices.iter().copied().filter(|&i| i <= last).collect();
            if valid.len() != indices.len() {
                iin.iin2 |= iin2::PARAMETER_ERROR;
            }
            if valid.is_empty() {
                return;
            }
            writer.indexed_header(group, variation, object_size(point_type));
            for index in valid {
                writer.u16(index);
                write_value(snapshot, writer, variation, point_type, points[usize::from(index)]);
            }
            return;
        }
    };

    writer.range_header(group, variation, start, object_size(point_type));
    for index in start..=stop {
        write_value(snapshot, writer, variation, point_type, points[usize::from(index)]);
    }
}

/// Encoded size of one static object; every analog variation served is flags plus four bytes
fn object_size(point_type: Dnp3PointType) -> usize {
    match point_type {
        Dnp3PointType::BinaryInput | Dnp3PointType::BinaryOutput => 1,
        Dnp3PointType::AnalogInput | Dnp3PointType::AnalogOutput => 5,
    }
}

fn write_value(
    snapshot: &Snapshot,
    writer: &mut ResponseWriter,
    variation: u8,
    point_type: Dnp3PointType,
    entry: usize,
) {
    match point_type {
        Dnp3PointType::BinaryInput | Dnp3PointType::BinaryOutput => {
            let closed = snapshot.image.binary(entry).unwrap_or(false);
            writer.u8(binary_flags(closed));
        }
        Dnp3PointType::AnalogInput | Dnp3PointType::AnalogOutput => {
            let value = snapshot.image.value(entry).unwrap_or(0.0);
            if variation == 1 {
                let rounded = value.round();
                let in_range = rounded >= f64::from(i32::MIN) && rounded <= f64::from(i32::MAX);
                let quality = if in_range { flags::ONLINE } else { flags::ONLINE | flags::OVER_RANGE };
                writer.u8(quality);
                writer.i32(rounded as i32);
            } else {
                writer.u8(flags::ONLINE);
                writer.f32(value as f32);
            }
        }
    }
}

fn binary_flags(state: bool) -> u8 {
    if state {
        flags::ONLINE | flags::STATE
    } else {
        flags::ONLINE
    }
}

/// g2v1 or g32v5 objects for `events`; false when there is nothing to write
fn write_event_objects(writer: &mut ResponseWriter, class: EventClass, events: &[Event]) -> bool {
    if events.is_empty() {
        return false;
    }
    let (group, variation, size) = match class {
        EventClass::One => (2, 1, 1),
        EventClass::Two => (32, 5, 5),
    };
    writer.indexed_header(group, variation, size);
    for event in events {
        writer.u16(event.index);
        match event.value {
            EventValue::Binary(state) => writer.u8(binary_flags(state)),
            EventValue::Analog(value) => {
                writer.u8(flags::ONLINE);
                writer.f32(value as f32);
            }
        }
    }
    true
}

/// DNP3 outstation accepting one session per master connection
pub struct Dnp3Outstation {
    config: Dnp3Config,
    store: SnapshotStore,
    router: Arc<CommandRouter>,
    events: EventBus,
    restart: Arc<AtomicBool>,
}

impl Dnp3Outstation {
    pub fn new(
        config: Dnp3Config,
        store: SnapshotStore,
        router: Arc<CommandRouter>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            store,
            router,
            events,
            restart: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Whether IIN1.7 is still set
    pub fn restart_pending(&self) -> bool {
        self.restart.load(Ordering::Acquire)
    }

    /// Fresh session state for a connection opened against `snapshot`
    pub fn session(&self, snapshot: &Snapshot) -> Session {
        Session {
            config: self.config.clone(),
            router: Arc::clone(&self.router),
            store: self.store.clone(),
            restart: Arc::clone(&self.restart),
            state: SessionState::Idle,
            link_reset: false,
            expected_fcb: true,
            reassembler: Reassembler::default(),
            transport_seq: 0,
            selection: None,
            buffer: EventBuffer::new(self.config.event_buffer_size),
            detector: ChangeDetector::new(snapshot, self.config.analog_deadband),
            solicited: None,
            continuation: VecDeque::new(),
            unsolicited: Unsolicited::default(),
            broadcast_seen: false,
        }
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, local = self.config.local_address, "dnp3 outstation listening");
        }
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let outstation = Arc::clone(&self);
                        let cancel = cancel.child_token();
                        tokio::spawn(async move { outstation.run_session(stream, peer, cancel).await });
                    }
                    Err(e) => warn!(error = %e, "dnp3 accept failed"),
                },
            }
        }
        info!("dnp3 outstation stopped");
    }

    async fn run_session(&self, mut stream: TcpStream, peer: SocketAddr, cancel: CancellationToken) {
        let mut updates = self.store.subscribe();
        let opened = Arc::clone(&updates.borrow_and_update());
        let epoch = opened.epoch;
        let mut session = self.session(&opened);
        let _ = stream.set_nodelay(true);

        debug!(%peer, epoch, "dnp3 session opened");
        self.events.publish(GatewayEvent::SessionOpened {
            protocol: SessionProtocol::Dnp3,
            peer: peer.to_string(),
            epoch,
            at: Utc::now(),
        });

        let mut buf: Vec<u8> = Vec::with_capacity(READ_CHUNK);
        let mut chunk = [0u8; READ_CHUNK];

        let reason = 'session: loop {
            let mut out = Vec::new();
            let deadline = session.next_deadline();

            tokio::select! {
                _ = cancel.cancelled() => break 'session "shutdown",
                changed = updates.changed() => {
                    if changed.is_err() {
                        break 'session "shutdown";
                    }
                    let snapshot = Arc::clone(&updates.borrow_and_update());
                    if snapshot.epoch != epoch {
                        break 'session "topology reloaded";
                    }
                    out = session.on_snapshot(&snapshot, Instant::now());
                }
                _ = wait_until(deadline) => {
                    out = session.on_timer(Instant::now());
                }
                read = stream.read(&mut chunk) => {
                    let n = match read {
                        Ok(0) => break 'session "peer closed",
                        Ok(n) => n,
                        Err(e) => {
                            debug!(%peer, error = %e, "dnp3 read failed");
                            break 'session "io error";
                        }
                    };
                    buf.extend_from_slice(&chunk[..n]);

                    let snapshot = self.store.current();
                    if snapshot.epoch != epoch {
                        break 'session "topology reloaded";
                    }
                    loop {
                        match link::parse_frame(&buf) {
                            LinkParse::Frame(frame, used) => {
                                buf.drain(..used);
                                out.extend(session.on_frame(frame, &snapshot, Instant::now()));
                            }
                            LinkParse::Skip(n, e) => {
                                trace!(%peer, error = %e, "discarding link bytes");
                                buf.drain(..n);
                            }
                            LinkParse::Incomplete => break,
                        }
                    }
                }
            }

            if !out.is_empty() {
                if let Err(e) = stream.write_all(&out).await {
                    debug!(%peer, error = %e, "dnp3 write failed");
                    break 'session "io error";
                }
            }
        };

        session.close();
        debug!(%peer, reason, "dnp3 session closed");
        self.events.publish(GatewayEvent::SessionClosed {
            protocol: SessionProtocol::Dnp3,
            peer: peer.to_string(),
            reason: reason.to_string(),
            at: Utc::now(),
        });
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
