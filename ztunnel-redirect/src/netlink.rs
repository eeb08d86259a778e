//! TC control over a blocking rtnetlink socket.
//!
//! Sessions are bound to the network namespace of the thread that opened
//! them, so namespace switching has to happen before `session()` is called.

use std::io;
use std::os::fd::RawFd;

use netlink_packet_core::{
    NetlinkHeader, NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_CREATE, NLM_F_DUMP, NLM_F_EXCL,
    NLM_F_REQUEST,
};
use netlink_packet_route::tc::{TcAttribute, TcHandle, TcMessage, TcOption};
use netlink_packet_route::RouteNetlinkMessage;
use netlink_packet_utils::nla::{DefaultNla, Nla, NlasIterator, NLA_TYPE_MASK};
use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};
use tracing::trace;

use crate::error::RedirectError;
use crate::netns::{NetnsDir, NetnsExec};
use crate::tc::{BpfFilter, Direction, TcBackend, TcFilter, TcSession, FILTER_KIND, QDISC_KIND};

// TC_H_MAKE(TC_H_CLSACT, 0) and TC_H_CLSACT.
const CLSACT_HANDLE: u32 = 0xffff_0000;
const CLSACT_PARENT: u32 = 0xffff_fff1;
// TC_H_MAKE(TC_H_CLSACT, TC_H_MIN_INGRESS / TC_H_MIN_EGRESS).
const INGRESS_PARENT: u32 = 0xffff_fff2;
const EGRESS_PARENT: u32 = 0xffff_fff3;

// linux/rtnetlink.h
const TCA_OPTIONS: u16 = 2;
// linux/pkt_cls.h
const TCA_BPF_FD: u16 = 6;
const TCA_BPF_NAME: u16 = 7;
const TCA_BPF_FLAGS: u16 = 8;
const TCA_BPF_FLAG_ACT_DIRECT: u32 = 1 << 0;

fn filter_parent(direction: Direction) -> TcHandle {
    match direction {
        Direction::Ingress => TcHandle::from(INGRESS_PARENT),
        Direction::Egress => TcHandle::from(EGRESS_PARENT),
    }
}

/// The host's TC subsystem and named namespaces.
#[derive(Clone, Debug, Default)]
pub struct LinuxKernel {
    netns: NetnsDir,
}

impl LinuxKernel {
    pub fn new(netns: NetnsDir) -> Self {
        Self { netns }
    }
}

impl TcBackend for LinuxKernel {
    type Session = NetlinkSession;

    fn session(&self) -> io::Result<NetlinkSession> {
        NetlinkSession::open()
    }
}

impl NetnsExec for LinuxKernel {
    fn with_netns<R, F>(&self, namespace: &str, f: F) -> Result<R, RedirectError>
    where
        F: FnOnce() -> Result<R, RedirectError>,
    {
        self.netns.with_netns(namespace, f)
    }
}

pub struct NetlinkSession {
    socket: Socket,
    sequence: u32,
}

impl NetlinkSession {
    pub fn open() -> io::Result<Self> {
        let mut socket = Socket::new(NETLINK_ROUTE)?;
        socket.bind_auto()?;
        socket.connect(&SocketAddr::new(0, 0))?;
        Ok(Self { socket, sequence: 0 })
    }

    fn send(&mut self, message: RouteNetlinkMessage, flags: u16) -> io::Result<u32> {
        self.sequence = self.sequence.wrapping_add(1);
        let mut header = NetlinkHeader::default();
        header.flags = flags;
        header.sequence_number = self.sequence;

        let mut packet = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(message));
        packet.finalize();
        let mut buf = vec![0u8; packet.buffer_len()];
        packet.serialize(&mut buf);

        trace!(sequence = self.sequence, len = buf.len(), "netlink request");
        self.socket.send(&buf, 0)?;
        Ok(self.sequence)
    }

    /// Sends a request that only expects an acknowledgement.
    fn request(&mut self, message: RouteNetlinkMessage, flags: u16) -> io::Result<()> {
        let sequence = self.send(message, flags | NLM_F_REQUEST | NLM_F_ACK)?;
        let mut done = false;
        while !done {
            self.receive(sequence, |payload| match payload {
                NetlinkPayload::Error(err) => {
                    done = true;
                    match err.code {
                        None => Ok(()),
                        Some(code) => Err(io::Error::from_raw_os_error(-code.get())),
                    }
                }
                _ => Ok(()),
            })?;
        }
        Ok(())
    }

    /// Sends a dump request and collects the replies until `NLMSG_DONE`.
    fn dump(&mut self, message: RouteNetlinkMessage) -> io::Result<Vec<RouteNetlinkMessage>> {
        let sequence = self.send(message, NLM_F_REQUEST | NLM_F_DUMP)?;
        let mut out = Vec::new();
        let mut done = false;
        while !done {
            self.receive(sequence, |payload| match payload {
                NetlinkPayload::InnerMessage(msg) => {
                    out.push(msg);
                    Ok(())
                }
                NetlinkPayload::Done(_) => {
                    done = true;
                    Ok(())
                }
                NetlinkPayload::Error(err) => {
                    done = true;
                    match err.code {
                        None => Ok(()),
                        Some(code) => Err(io::Error::from_raw_os_error(-code.get())),
                    }
                }
                _ => Ok(()),
            })?;
        }
        Ok(out)
    }

    /// Reads one datagram and hands every message of `sequence` in it to
    /// `handle`.
    fn receive<F>(&mut self, sequence: u32, mut handle: F) -> io::Result<()>
    where
        F: FnMut(NetlinkPayload<RouteNetlinkMessage>) -> io::Result<()>,
    {
        let (buf, _) = self.socket.recv_from_full()?;
        let mut offset = 0;
        while offset < buf.len() {
            let msg = NetlinkMessage::<RouteNetlinkMessage>::deserialize(&buf[offset..])
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            let len = msg.header.length as usize;
            if len == 0 {
                break;
            }
            offset += (len + 3) & !3;

            if msg.header.sequence_number != sequence {
                trace!(expected = sequence, got = msg.header.sequence_number, "skipping stale reply");
                continue;
            }
            handle(msg.payload)?;
        }
        Ok(())
    }
}

fn qdisc_message(ifindex: u32) -> TcMessage {
    let mut msg = TcMessage::with_index(ifindex as i32);
    msg.header.parent = TcHandle::from(CLSACT_PARENT);
    msg.header.handle = TcHandle::from(CLSACT_HANDLE);
    msg.attributes.push(TcAttribute::Kind(QDISC_KIND.to_string()));
    msg
}

fn bpf_options(fd: RawFd, name: &str) -> Vec<TcOption> {
    let mut name_bytes = name.as_bytes().to_vec();
    name_bytes.push(0);
    vec![
        TcOption::Other(DefaultNla::new(TCA_BPF_FD, (fd as u32).to_ne_bytes().to_vec())),
        TcOption::Other(DefaultNla::new(TCA_BPF_NAME, name_bytes)),
        TcOption::Other(DefaultNla::new(
            TCA_BPF_FLAGS,
            TCA_BPF_FLAG_ACT_DIRECT.to_ne_bytes().to_vec(),
        )),
    ]
}

/// Reads `TCA_BPF_NAME` out of a filter's options.
///
/// Filters built locally carry the bpf attributes directly. Kernel dumps of
/// `bpf` filters come back as a single unparsed `TCA_OPTIONS` nest.
fn bpf_name(options: &[TcOption]) -> Option<String> {
    options.iter().find_map(|opt| match opt {
        TcOption::Other(nla) => {
            let mut value = vec![0u8; nla.value_len()];
            nla.emit_value(&mut value);
            match nla.kind() & NLA_TYPE_MASK {
                TCA_BPF_NAME => Some(nul_terminated(&value)),
                TCA_OPTIONS => nested_bpf_name(&value),
                _ => None,
            }
        }
        _ => None,
    })
}

fn nested_bpf_name(nest: &[u8]) -> Option<String> {
    NlasIterator::new(nest)
        .filter_map(Result::ok)
        .find(|nla| nla.kind() == TCA_BPF_NAME)
        .map(|nla| nul_terminated(nla.value()))
}

fn nul_terminated(value: &[u8]) -> String {
    let end = value.iter().position(|b| *b == 0).unwrap_or(value.len());
    String::from_utf8_lossy(&value[..end]).into_owned()
}

fn parse_filter(direction: Direction, msg: TcMessage) -> TcFilter {
    let mut kind = String::new();
    let mut name = None;
    for attr in &msg.attributes {
        match attr {
            TcAttribute::Kind(k) => kind = k.clone(),
            TcAttribute::Options(options) => name = bpf_name(options),
            _ => {}
        }
    }
    TcFilter {
        ifindex: msg.header.index as u32,
        direction,
        handle: u32::from(msg.header.handle),
        info: msg.header.info,
        kind,
        bpf_name: name,
    }
}

impl TcSession for NetlinkSession {
    fn add_clsact_qdisc(&mut self, ifindex: u32) -> io::Result<()> {
        self.request(
            RouteNetlinkMessage::NewQueueDiscipline(qdisc_message(ifindex)),
            NLM_F_CREATE | NLM_F_EXCL,
        )
    }

    fn del_clsact_qdisc(&mut self, ifindex: u32) -> io::Result<()> {
        self.request(RouteNetlinkMessage::DelQueueDiscipline(qdisc_message(ifindex)), 0)
    }

    fn add_bpf_filter(&mut self, filter: &BpfFilter) -> io::Result<()> {
        let mut msg = TcMessage::with_index(filter.ifindex as i32);
        msg.header.parent = filter_parent(filter.direction);
        msg.header.handle = TcHandle::from(filter.handle);
        msg.header.info = filter.info();
        msg.attributes.push(TcAttribute::Kind(FILTER_KIND.to_string()));
        msg.attributes
            .push(TcAttribute::Options(bpf_options(filter.fd, &filter.name)));

        self.request(
            RouteNetlinkMessage::NewTrafficFilter(msg),
            NLM_F_CREATE | NLM_F_EXCL,
        )
    }

    fn filters(&mut self, ifindex: u32, direction: Direction) -> io::Result<Vec<TcFilter>> {
        let mut msg = TcMessage::with_index(ifindex as i32);
        msg.header.parent = filter_parent(direction);

        let replies = self.dump(RouteNetlinkMessage::GetTrafficFilter(msg))?;
        Ok(replies
            .into_iter()
            .filter_map(|reply| match reply {
                RouteNetlinkMessage::NewTrafficFilter(msg) => Some(parse_filter(direction, msg)),
                _ => None,
            })
            .collect())
    }

    fn del_filter(&mut self, filter: &TcFilter) -> io::Result<()> {
        let mut msg = TcMessage::with_index(filter.ifindex as i32);
        msg.header.parent = filter_parent(filter.direction);
        msg.header.handle = TcHandle::from(filter.handle);
        msg.header.info = filter.info;
        msg.attributes.push(TcAttribute::Kind(filter.kind.clone()));

        self.request(RouteNetlinkMessage::DelTrafficFilter(msg), 0)
    }
}
