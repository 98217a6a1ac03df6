//! Shared-memory endpoint: address resolution, progress, message paths,
//! retries and cancellation.

use std::collections::{HashMap, VecDeque};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock, Weak};
use std::time::Duration;

use quanta::Instant;

use crate::addr::Addr;
use crate::context::Context;
use crate::error::{NaError, Result};
use crate::op::{Callback, OpId, OpKind, Tag};
use crate::util::spin::Spin;

use super::addr::{AddrKey, SmAddr, SmAddrRef, ADDR_CMD_PUSHED, ADDR_RESERVED, ADDR_RESOLVED};
use super::event::Notifier;
use super::hostid::host_id;
use super::op::{
    OpQueue, SmOp, OP_CANCELED, OP_COMPLETED, OP_ERRORED, OP_QUEUED, OP_RETRYING,
};
use super::poll::Poller;
use super::region::{region_get_addr_key, RegionHandle};
use super::ring::{CmdHdr, CmdKind, MsgHdr, MsgKind};
use super::sock::{event_recv, event_send, sock_cleanup, sock_open};
use super::{SmContext, COPY_BUF_SIZE, MAX_EVENTS};

/// What a poll-set token points at.
#[derive(Clone)]
enum PollTarget {
    Sock,
    TxNotify(Weak<SmAddr>),
    RxNotify(Weak<SmAddr>),
}

/// Unexpected message cached before any receive was posted.
struct UnexpectedMsg {
    source: SmAddrRef,
    data: Vec<u8>,
    tag: Tag,
}

/// Serialized address: host id, pid, sm id.
const ADDR_SERIALIZE_SIZE: usize = 16 + 4 + 1;

pub(crate) struct SmEndpoint {
    weak_self: Weak<SmEndpoint>,
    src_key: AddrKey,
    uri: String,
    listen: bool,
    addr_map: RwLock<HashMap<AddrKey, Weak<SmAddr>>>,
    unexpected_msgs: Spin<VecDeque<UnexpectedMsg>>,
    unexpected_ops: OpQueue,
    expected_ops: OpQueue,
    retry_ops: OpQueue,
    poll_addrs: Spin<Vec<Arc<SmAddr>>>,
    source_addr: OnceLock<Arc<SmAddr>>,
    poller: Option<Poller>,
    poll_targets: Spin<HashMap<u64, PollTarget>>,
    next_token: AtomicU64,
    sock: Spin<Option<OwnedFd>>,
    nofile: AtomicI32,
    nofile_max: u32,
}

impl SmEndpoint {
    /// Open an endpoint.
    ///
    /// Listening endpoints create and own a shared region plus a bound
    /// control socket; with `no_block` no poll set or descriptors are
    /// created at all and progress is purely ring-polling.
    pub(crate) fn open(
        name: Option<&str>,
        listen: bool,
        no_block: bool,
        nofile_max: u32,
    ) -> Result<Arc<Self>> {
        static SM_ID: AtomicU32 = AtomicU32::new(0);

        // SAFETY: FFI, no side effects.
        let pid = unsafe { libc::getpid() };
        let id = SM_ID.fetch_add(1, Ordering::AcqRel);
        if id > u32::from(u8::MAX) {
            log::error!("reached the maximum number of SM instances for this process");
            return Err(NaError::Overflow);
        }
        let src_key = AddrKey {
            pid,
            id: id as u8,
        };
        let uri = match name {
            Some(name) => name.to_owned(),
            None => src_key.to_uri(),
        };
        log::debug!("opening endpoint {uri} (pid={pid}, id={id}, listen={listen})");

        let region = if listen {
            Some(Arc::new(RegionHandle::open(&uri, true, Some(src_key))?))
        } else {
            None
        };

        let poller = if no_block { None } else { Some(Poller::new()?) };

        let endpoint = Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            src_key,
            uri: uri.clone(),
            listen,
            addr_map: RwLock::new(HashMap::new()),
            unexpected_msgs: Spin::new(VecDeque::new()),
            unexpected_ops: Spin::new(VecDeque::new()),
            expected_ops: Spin::new(VecDeque::new()),
            retry_ops: Spin::new(VecDeque::new()),
            poll_addrs: Spin::new(Vec::new()),
            source_addr: OnceLock::new(),
            poller,
            poll_targets: Spin::new(HashMap::new()),
            next_token: AtomicU64::new(0),
            sock: Spin::new(None),
            nofile: AtomicI32::new(0),
            nofile_max,
        });

        if endpoint.poller.is_some() {
            endpoint.nofile_incr();

            endpoint.fd_check(1)?;
            let sock = sock_open(listen.then_some(uri.as_str()), listen)?;
            endpoint.nofile_incr();
            if listen {
                endpoint.register_poll(sock.as_raw_fd(), PollTarget::Sock)?;
            }
            *endpoint.sock.lock() = Some(sock);
        }

        let source = SmAddr::new(Arc::downgrade(&endpoint), src_key, Some(uri.clone()), false, true);
        if let Some(region) = region {
            let pair_idx = region.reserve_queue_pair()?;
            source.set_pair_idx(pair_idx);
            source.set_status(ADDR_RESERVED);
            *source.region.lock() = Some(region);
        }

        if endpoint.poller.is_some() {
            endpoint.fd_check(2)?;
            let tx = Arc::new(Notifier::anonymous()?);
            endpoint.nofile_incr();
            let rx = Arc::new(Notifier::anonymous()?);
            endpoint.nofile_incr();

            let tx_token =
                endpoint.register_poll(tx.as_raw_fd(), PollTarget::TxNotify(Arc::downgrade(&source)))?;
            let rx_token =
                endpoint.register_poll(rx.as_raw_fd(), PollTarget::RxNotify(Arc::downgrade(&source)))?;

            let mut fds = source.fds.lock();
            fds.tx = Some(tx);
            fds.rx = Some(rx);
            fds.tx_token = Some(tx_token);
            fds.rx_token = Some(rx_token);
        }

        source.set_status(ADDR_RESOLVED);
        if listen {
            endpoint.poll_addrs.lock().push(source.clone());
        }
        let _ = endpoint.source_addr.set(source);

        Ok(endpoint)
    }

    /// Checked teardown.
    ///
    /// Remaining peer addresses are force-released; operations still parked
    /// on any queue make the close fail with `Busy`.
    pub(crate) fn close(&self) -> Result<()> {
        let source = self.source_addr.get().cloned();

        let drained = std::mem::take(&mut *self.poll_addrs.lock());
        for addr in drained {
            if source.as_ref().is_some_and(|s| Arc::ptr_eq(s, &addr)) {
                continue;
            }
            self.addr_release(&addr);
        }

        if !self.unexpected_msgs.lock().is_empty() {
            log::error!("unexpected messages remain buffered on close");
            return Err(NaError::Busy);
        }
        if !self.unexpected_ops.lock().is_empty()
            || !self.expected_ops.lock().is_empty()
            || !self.retry_ops.lock().is_empty()
        {
            log::error!("operations remain queued on close");
            return Err(NaError::Busy);
        }

        if let Some(source) = source {
            let region = source.region.lock().take();
            if let Some(region) = region {
                region.release_queue_pair(source.pair_idx());
            }

            let (tx, rx, tx_token, rx_token) = {
                let mut fds = source.fds.lock();
                (
                    fds.tx.take(),
                    fds.rx.take(),
                    fds.tx_token.take(),
                    fds.rx_token.take(),
                )
            };
            if let Some(tx) = tx {
                if let Some(token) = tx_token {
                    self.deregister_poll(tx.as_raw_fd(), token);
                }
                self.nofile_decr();
            }
            if let Some(rx) = rx {
                if let Some(token) = rx_token {
                    self.deregister_poll(rx.as_raw_fd(), token);
                }
                self.nofile_decr();
            }
        }

        if let Some(sock) = self.sock.lock().take() {
            drop(sock);
            self.nofile_decr();
            if self.listen {
                sock_cleanup(&self.uri);
            }
        }

        // The poll set itself is the only descriptor left; it goes away
        // with the endpoint.
        let expected = i32::from(self.poller.is_some());
        let nofile = self.nofile.load(Ordering::Acquire);
        if nofile != expected {
            log::error!("file descriptors remain open on this endpoint (nofile={nofile})");
            return Err(NaError::Busy);
        }

        Ok(())
    }

    fn source(&self) -> Result<&Arc<SmAddr>> {
        self.source_addr.get().ok_or(NaError::ProtocolError)
    }

    fn nofile_incr(&self) {
        self.nofile.fetch_add(1, Ordering::AcqRel);
    }

    fn nofile_decr(&self) {
        self.nofile.fetch_sub(1, Ordering::AcqRel);
    }

    /// Fail `NoDev` when allocating `need` more descriptors would exceed
    /// the endpoint's share of `RLIMIT_NOFILE`.
    fn fd_check(&self, need: i32) -> Result<()> {
        if self.nofile.load(Ordering::Acquire) + need > self.nofile_max as i32 {
            log::error!(
                "endpoint would exceed RLIMIT_NOFILE ({} descriptors); raise the limit or \
                 free addresses",
                self.nofile_max
            );
            return Err(NaError::NoDev);
        }
        Ok(())
    }

    fn register_poll(&self, fd: RawFd, target: PollTarget) -> Result<u64> {
        let poller = self.poller.as_ref().ok_or(NaError::OpNotSupported)?;
        let token = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        poller.register(fd, token)?;
        self.poll_targets.lock().insert(token, target);
        Ok(token)
    }

    fn deregister_poll(&self, fd: RawFd, token: u64) {
        if let Some(poller) = &self.poller {
            if let Err(err) = poller.deregister(fd) {
                log::warn!("could not deregister descriptor {fd}: {err}");
            }
        }
        self.poll_targets.lock().remove(&token);
    }

    fn poll_addr_remove(&self, addr: &SmAddr) {
        let mut list = self.poll_addrs.lock();
        list.retain(|a| !std::ptr::eq(Arc::as_ptr(a), addr));
    }

    /// Release path run exactly once when an address's logical reference
    /// count reaches zero.
    pub(crate) fn addr_release(&self, addr: &SmAddr) {
        if addr.is_source {
            return;
        }
        log::debug!("releasing addr {}", addr.uri());

        self.poll_addr_remove(addr);
        {
            let mut map = self.addr_map.write().unwrap();
            if let Some(existing) = map.get(&addr.key) {
                if std::ptr::eq(existing.as_ptr(), addr) {
                    map.remove(&addr.key);
                }
            }
        }

        if let Some(region) = self.sockless_region_take(addr) {
            if addr.unexpected {
                // Passive side owns the slot release.
                region.release_queue_pair(addr.pair_idx());
            } else if addr.status() & ADDR_RESERVED != 0 {
                let cmd = CmdHdr {
                    pid: self.src_key.pid,
                    id: self.src_key.id,
                    pair_idx: addr.pair_idx(),
                    kind: CmdKind::Released,
                };
                // Best effort: the peer releases the slot when it sees the
                // command, or at its own teardown.
                if self.poller.is_some() {
                    if let Some(sock) = self.sock_fd() {
                        let _ = event_send(sock, addr.uri(), cmd.to_raw(), None, true);
                    }
                } else if !region.cmd_ring().push(cmd.to_raw()) {
                    log::warn!("peer command ring full, leaking queue pair {}", addr.pair_idx());
                }
            }
        }

        let (tx, rx, tx_token, rx_token) = {
            let mut fds = addr.fds.lock();
            (
                fds.tx.take(),
                fds.rx.take(),
                fds.tx_token.take(),
                fds.rx_token.take(),
            )
        };
        if let Some(tx) = tx {
            if let Some(token) = tx_token {
                self.deregister_poll(tx.as_raw_fd(), token);
            }
            self.nofile_decr();
        }
        if let Some(rx) = rx {
            if let Some(token) = rx_token {
                self.deregister_poll(rx.as_raw_fd(), token);
            }
            self.nofile_decr();
        }
    }

    fn sockless_region_take(&self, addr: &SmAddr) -> Option<Arc<RegionHandle>> {
        addr.region.lock().take()
    }

    fn sock_fd(&self) -> Option<RawFd> {
        self.sock.lock().as_ref().map(|s| s.as_raw_fd())
    }

    /// Look up or create the address for `name`.
    pub(crate) fn addr_lookup(&self, name: &str) -> Result<Addr> {
        let uri = match name.rsplit_once("://") {
            Some((_, uri)) => uri,
            None => name,
        };
        if uri.is_empty() {
            return Err(NaError::InvalidArg);
        }

        let key = match AddrKey::parse(uri) {
            Some(key) => key,
            // Custom endpoint names carry the owner key inside the region.
            None => region_get_addr_key(uri)?,
        };

        if key == self.src_key {
            return self.addr_self();
        }
        self.addr_map_insert(key, uri)
    }

    /// The endpoint's own address.
    pub(crate) fn addr_self(&self) -> Result<Addr> {
        Ok(SmAddrRef::new(self.source()?).into_addr())
    }

    fn addr_map_insert(&self, key: AddrKey, uri: &str) -> Result<Addr> {
        {
            let map = self.addr_map.read().unwrap();
            if let Some(addr) = map.get(&key).and_then(Weak::upgrade) {
                if let Some(addr_ref) = SmAddr::try_ref(&addr) {
                    return Ok(addr_ref.into_addr());
                }
            }
        }

        let mut map = self.addr_map.write().unwrap();
        // Look up again to prevent a race between lock release/acquire.
        if let Some(addr) = map.get(&key).and_then(Weak::upgrade) {
            if let Some(addr_ref) = SmAddr::try_ref(&addr) {
                return Ok(addr_ref.into_addr());
            }
        }
        let addr = SmAddr::new(self.weak_self.clone(), key, Some(uri.to_owned()), false, false);
        map.insert(key, Arc::downgrade(&addr));
        Ok(SmAddrRef::adopt(addr).into_addr())
    }

    /// Serialize an address for a same-host peer.
    pub(crate) fn addr_serialize(&self, addr: &SmAddr) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(ADDR_SERIALIZE_SIZE);
        bytes.extend_from_slice(&host_id().to_le_bytes());
        bytes.extend_from_slice(&addr.key.pid.to_le_bytes());
        bytes.push(addr.key.id);
        bytes
    }

    /// Reconstruct a serialized address.
    pub(crate) fn addr_deserialize(&self, bytes: &[u8]) -> Result<Addr> {
        if bytes.len() < ADDR_SERIALIZE_SIZE {
            return Err(NaError::InvalidArg);
        }
        let peer_host = u128::from_le_bytes(bytes[0..16].try_into().expect("sliced"));
        if peer_host != host_id() {
            log::error!("address was serialized on a different host");
            return Err(NaError::AddrNotAvail);
        }
        let key = AddrKey {
            pid: i32::from_le_bytes(bytes[16..20].try_into().expect("sliced")),
            id: bytes[20],
        };
        if key == self.src_key {
            return self.addr_self();
        }
        let uri = key.to_uri();
        self.addr_map_insert(key, &uri)
    }

    /// Drive an address towards `Resolved`; caller holds the resolve lock.
    ///
    /// Every stage is recorded in the status word so a retry after `Again`
    /// resumes where it left off.
    fn addr_resolve(&self, addr: &Arc<SmAddr>) -> Result<()> {
        if addr.is_resolved() {
            return Ok(());
        }

        if addr.region().is_none() {
            let region = RegionHandle::open(addr.uri(), false, None)?;
            *addr.region.lock() = Some(Arc::new(region));
        }
        let region = addr.region().ok_or(NaError::Fault)?;

        match self.addr_resolve_steps(addr, &region) {
            Ok(()) => Ok(()),
            Err(NaError::Again) => Err(NaError::Again),
            Err(err) => {
                self.addr_resolve_rollback(addr, &region);
                Err(err)
            }
        }
    }

    fn addr_resolve_steps(&self, addr: &Arc<SmAddr>, region: &RegionHandle) -> Result<()> {
        if addr.status() & ADDR_RESERVED == 0 {
            let pair_idx = region.reserve_queue_pair()?;
            addr.set_pair_idx(pair_idx);
            addr.set_status(ADDR_RESERVED);
        }

        let cmd = CmdHdr {
            pid: self.src_key.pid,
            id: self.src_key.id,
            pair_idx: addr.pair_idx(),
            kind: CmdKind::Reserved,
        };

        if addr.status() & ADDR_CMD_PUSHED == 0 {
            if !region.cmd_ring().push(cmd.to_raw()) {
                return Err(NaError::Again);
            }
            addr.set_status(ADDR_CMD_PUSHED);
        }

        if self.poller.is_some() {
            let tx = match addr.fds.lock().tx.clone() {
                Some(tx) => tx,
                None => {
                    self.fd_check(1)?;
                    let tx = Arc::new(Notifier::create(addr.uri(), addr.pair_idx(), 't')?);
                    self.nofile_incr();
                    addr.fds.lock().tx = Some(tx.clone());
                    tx
                }
            };
            let rx = match addr.fds.lock().rx.clone() {
                Some(rx) => rx,
                None => {
                    self.fd_check(1)?;
                    let rx = Arc::new(Notifier::create(addr.uri(), addr.pair_idx(), 'r')?);
                    self.nofile_incr();
                    let token =
                        self.register_poll(rx.as_raw_fd(), PollTarget::RxNotify(Arc::downgrade(addr)))?;
                    let mut fds = addr.fds.lock();
                    fds.rx = Some(rx.clone());
                    fds.rx_token = Some(token);
                    rx
                }
            };

            let sock = self.sock_fd().ok_or(NaError::ProtocolError)?;
            event_send(
                sock,
                addr.uri(),
                cmd.to_raw(),
                Some((tx.as_raw_fd(), rx.as_raw_fd())),
                false,
            )?;
        }

        addr.set_status(ADDR_RESOLVED);
        self.poll_addrs.lock().push(addr.clone());
        log::debug!("resolved addr {} (pair {})", addr.uri(), addr.pair_idx());

        Ok(())
    }

    fn addr_resolve_rollback(&self, addr: &Arc<SmAddr>, region: &RegionHandle) {
        if addr.status() & ADDR_RESERVED != 0 {
            region.release_queue_pair(addr.pair_idx());
            addr.clear_status(ADDR_RESERVED);
        }
        let (tx, rx, tx_token, rx_token) = {
            let mut fds = addr.fds.lock();
            (
                fds.tx.take(),
                fds.rx.take(),
                fds.tx_token.take(),
                fds.rx_token.take(),
            )
        };
        if let Some(tx) = tx {
            if let Some(token) = tx_token {
                self.deregister_poll(tx.as_raw_fd(), token);
            }
            self.nofile_decr();
        }
        if let Some(rx) = rx {
            if let Some(token) = rx_token {
                self.deregister_poll(rx.as_raw_fd(), token);
            }
            self.nofile_decr();
        }
        *addr.region.lock() = None;
    }

    /// Submit path common to expected and unexpected sends.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn msg_send(
        &self,
        ctx: &Context,
        kind: OpKind,
        cb: Callback,
        buf: &[u8],
        dest: &Addr,
        tag: Tag,
        op: &OpId,
    ) -> Result<()> {
        if buf.len() > COPY_BUF_SIZE {
            log::error!("message exceeds copy-buffer size ({} bytes)", buf.len());
            return Err(NaError::Overflow);
        }
        let sm_op = op.downcast_arc::<SmOp>().ok_or(NaError::InvalidArg)?;
        let sm_addr = dest.downcast_arc::<SmAddr>().ok_or(NaError::InvalidArg)?;
        if sm_op.status() & OP_COMPLETED == 0 {
            log::error!("attempting to reuse an operation that has not completed");
            return Err(NaError::Busy);
        }

        sm_op.reset(kind, ctx, cb, Some(SmAddrRef::new(&sm_addr)));
        {
            let mut state = sm_op.state.lock();
            state.tag = tag;
            state.send_data.extend_from_slice(buf);
        }

        match self.msg_send_post(kind, buf, &sm_addr, tag) {
            Ok(()) => {
                // Completed on the wire; the peer owns the copy buffer now.
                sm_op.complete(Ok(()));
                self.complete_signal();
                Ok(())
            }
            Err(NaError::Again) => {
                self.op_retry(&sm_op);
                Ok(())
            }
            Err(err) => {
                sm_op.release();
                Err(err)
            }
        }
    }

    fn msg_send_post(
        &self,
        kind: OpKind,
        data: &[u8],
        addr: &Arc<SmAddr>,
        tag: Tag,
    ) -> Result<()> {
        if !addr.is_resolved() {
            let _guard = addr.resolve_lock.lock().unwrap();
            match self.addr_resolve(addr) {
                Ok(()) => {}
                Err(NaError::Again) => return Err(NaError::Again),
                Err(err) => {
                    log::error!("could not resolve addr {}: {err}", addr.uri());
                    return Err(err);
                }
            }
        }

        let region = addr.region().ok_or(NaError::ProtocolError)?;

        let mut buf_idx = 0;
        if !data.is_empty() {
            buf_idx = region.copy_bufs().reserve()?;
            region.copy_bufs().copy_to(buf_idx, data);
        }

        let hdr = MsgHdr {
            tag,
            buf_size: data.len() as u16,
            buf_idx,
            kind: MsgKind::from_op_kind(kind).ok_or(NaError::InvalidArg)?,
        };
        if !addr.tx_ring(&region).push(hdr.to_raw()) {
            if !data.is_empty() {
                region.copy_bufs().release(buf_idx);
            }
            return Err(NaError::Again);
        }

        // Wake the consumer: ourselves for loopback, the peer otherwise.
        let notifier = {
            let fds = addr.fds.lock();
            if addr.is_source {
                fds.rx.clone()
            } else {
                fds.tx.clone()
            }
        };
        if let Some(notifier) = notifier {
            notifier.signal()?;
        }

        Ok(())
    }

    /// Post a receive for a message from any source.
    pub(crate) fn msg_recv_unexpected(
        &self,
        ctx: &Context,
        cb: Callback,
        buf: Vec<u8>,
        op: &OpId,
    ) -> Result<()> {
        if buf.len() > COPY_BUF_SIZE {
            return Err(NaError::Overflow);
        }
        let sm_op = op.downcast_arc::<SmOp>().ok_or(NaError::InvalidArg)?;
        if sm_op.status() & OP_COMPLETED == 0 {
            log::error!("attempting to reuse an operation that has not completed");
            return Err(NaError::Busy);
        }

        sm_op.reset(OpKind::RecvUnexpected, ctx, cb, None);
        sm_op.state.lock().recv_buf = Some(buf);

        let pending = self.unexpected_msgs.lock().pop_front();
        if let Some(msg) = pending {
            {
                let mut state = sm_op.state.lock();
                let recv_buf = state.recv_buf.as_mut().expect("buffer just posted");
                let n = msg.data.len().min(recv_buf.len());
                recv_buf[..n].copy_from_slice(&msg.data[..n]);
                state.recv_actual = n;
                state.recv_tag = msg.tag;
                state.recv_source = Some(msg.source);
            }
            sm_op.complete(Ok(()));
            self.complete_signal();
        } else {
            let mut queue = self.unexpected_ops.lock();
            sm_op.set_status(OP_QUEUED);
            queue.push_back(sm_op);
        }

        Ok(())
    }

    /// Post a receive matched on `(source, tag)` at progress time.
    pub(crate) fn msg_recv_expected(
        &self,
        ctx: &Context,
        cb: Callback,
        buf: Vec<u8>,
        source: &Addr,
        tag: Tag,
        op: &OpId,
    ) -> Result<()> {
        if buf.len() > COPY_BUF_SIZE {
            return Err(NaError::Overflow);
        }
        let sm_op = op.downcast_arc::<SmOp>().ok_or(NaError::InvalidArg)?;
        let sm_addr = source.downcast_arc::<SmAddr>().ok_or(NaError::InvalidArg)?;
        if sm_op.status() & OP_COMPLETED == 0 {
            log::error!("attempting to reuse an operation that has not completed");
            return Err(NaError::Busy);
        }

        sm_op.reset(OpKind::RecvExpected, ctx, cb, Some(SmAddrRef::new(&sm_addr)));
        {
            let mut state = sm_op.state.lock();
            state.tag = tag;
            state.recv_buf = Some(buf);
        }

        // Expected messages are matched against pre-posted receives only;
        // always park.
        let mut queue = self.expected_ops.lock();
        sm_op.set_status(OP_QUEUED);
        queue.push_back(sm_op);

        Ok(())
    }

    /// Park a send whose submission returned `Again`.
    fn op_retry(&self, op: &Arc<SmOp>) {
        log::debug!("parking send on the retry queue");
        let mut queue = self.retry_ops.lock();
        op.set_status(OP_QUEUED);
        queue.push_back(op.clone());
    }

    /// Drain the retry queue in FIFO order.
    ///
    /// Stops at the first send still returning `Again` to preserve message
    /// order, and at the first hard error, which is surfaced on that
    /// operation only.
    fn process_retries(&self) -> Result<()> {
        loop {
            let op = {
                let queue = self.retry_ops.lock();
                match queue.front() {
                    Some(op) => {
                        // Prevent a concurrent cancel from unlinking the op
                        // while we re-run the send path.
                        op.set_status(OP_RETRYING);
                        op.clone()
                    }
                    None => break,
                }
            };

            let (kind, data, tag, addr) = {
                let state = op.state.lock();
                (
                    state.kind,
                    state.send_data.clone(),
                    state.tag,
                    state.addr.clone(),
                )
            };
            let Some(addr) = addr else {
                {
                    let mut queue = self.retry_ops.lock();
                    queue.retain(|o| !Arc::ptr_eq(o, &op));
                    op.clear_status(OP_RETRYING | OP_QUEUED);
                    op.set_status(OP_ERRORED);
                }
                op.complete(Err(NaError::ProtocolError));
                break;
            };

            match self.msg_send_post(kind, &data, addr.arc(), tag) {
                Ok(()) => {
                    {
                        let mut queue = self.retry_ops.lock();
                        op.clear_status(OP_RETRYING);
                        queue.retain(|o| !Arc::ptr_eq(o, &op));
                        op.clear_status(OP_QUEUED);
                    }
                    op.complete(Ok(()));
                }
                Err(NaError::Again) => {
                    let canceled = {
                        let mut queue = self.retry_ops.lock();
                        op.clear_status(OP_RETRYING);
                        if op.status() & OP_CANCELED != 0 {
                            queue.retain(|o| !Arc::ptr_eq(o, &op));
                            op.clear_status(OP_QUEUED);
                            true
                        } else {
                            false
                        }
                    };
                    if canceled {
                        op.complete(Err(NaError::Canceled));
                    }
                    break;
                }
                Err(err) => {
                    log::error!("could not post retried send: {err}");
                    {
                        let mut queue = self.retry_ops.lock();
                        op.clear_status(OP_RETRYING);
                        op.set_status(OP_ERRORED);
                        queue.retain(|o| !Arc::ptr_eq(o, &op));
                        op.clear_status(OP_QUEUED);
                    }
                    op.complete(Err(err));
                    break;
                }
            }
        }
        Ok(())
    }

    /// Wake any local `poll_wait` caller after an inline completion.
    fn complete_signal(&self) {
        if let Some(source) = self.source_addr.get() {
            let tx = source.fds.lock().tx.clone();
            if let Some(tx) = tx {
                if let Err(err) = tx.signal() {
                    log::warn!("could not signal completion: {err}");
                }
            }
        }
    }

    /// Pop and dispatch one message from an address's rx ring.
    fn progress_rx_queue(&self, addr: &Arc<SmAddr>) -> Result<bool> {
        let Some(region) = addr.region() else {
            return Ok(false);
        };
        let Some(raw) = addr.rx_ring(&region).pop() else {
            return Ok(false);
        };
        let hdr = MsgHdr::from_raw(raw).ok_or(NaError::ProtocolError)?;
        log::debug!("found msg in queue (tag={}, size={})", hdr.tag, hdr.buf_size);

        match hdr.kind {
            MsgKind::Unexpected => self.process_unexpected(addr, &region, hdr),
            MsgKind::Expected => {
                self.process_expected(addr, &region, hdr);
                Ok(())
            }
        }?;
        Ok(true)
    }

    fn process_unexpected(
        &self,
        addr: &Arc<SmAddr>,
        region: &RegionHandle,
        hdr: MsgHdr,
    ) -> Result<()> {
        let op = {
            let mut queue = self.unexpected_ops.lock();
            let op = queue.pop_front();
            if let Some(op) = &op {
                op.clear_status(OP_QUEUED);
            }
            op
        };

        match op {
            Some(op) => {
                {
                    let mut state = op.state.lock();
                    state.recv_tag = hdr.tag;
                    state.recv_source = Some(SmAddrRef::new(addr));
                    let recv_buf = state.recv_buf.as_mut().ok_or(NaError::ProtocolError)?;
                    let n = usize::from(hdr.buf_size).min(recv_buf.len());
                    if hdr.buf_size > 0 {
                        region.copy_bufs().copy_from(hdr.buf_idx, &mut recv_buf[..n]);
                        region.copy_bufs().release(hdr.buf_idx);
                    }
                    state.recv_actual = n;
                }
                op.complete(Ok(()));
            }
            None => {
                log::warn!("no operation was preposted, caching unexpected message");
                let mut data = vec![0u8; usize::from(hdr.buf_size)];
                if hdr.buf_size > 0 {
                    region.copy_bufs().copy_from(hdr.buf_idx, &mut data);
                    region.copy_bufs().release(hdr.buf_idx);
                }
                self.unexpected_msgs.lock().push_back(UnexpectedMsg {
                    source: SmAddrRef::new(addr),
                    data,
                    tag: hdr.tag,
                });
            }
        }
        Ok(())
    }

    fn process_expected(&self, addr: &Arc<SmAddr>, region: &RegionHandle, hdr: MsgHdr) {
        let op = {
            let mut queue = self.expected_ops.lock();
            let pos = queue.iter().position(|op| {
                let state = op.state.lock();
                state.tag == hdr.tag
                    && state
                        .addr
                        .as_ref()
                        .is_some_and(|a| Arc::ptr_eq(a.arc(), addr))
            });
            match pos {
                Some(pos) => {
                    let op = queue.remove(pos).expect("position just found");
                    op.clear_status(OP_QUEUED);
                    Some(op)
                }
                None => None,
            }
        };

        let Some(op) = op else {
            // No posted operation matches: drop the message.
            log::warn!(
                "no operation posted for expected msg (tag={}), dropping",
                hdr.tag
            );
            if hdr.buf_size > 0 {
                region.copy_bufs().release(hdr.buf_idx);
            }
            return;
        };

        {
            let mut state = op.state.lock();
            if let Some(recv_buf) = state.recv_buf.as_mut() {
                let n = usize::from(hdr.buf_size).min(recv_buf.len());
                if hdr.buf_size > 0 {
                    region.copy_bufs().copy_from(hdr.buf_idx, &mut recv_buf[..n]);
                    region.copy_bufs().release(hdr.buf_idx);
                }
                state.recv_actual = n;
            }
        }
        op.complete(Ok(()));
    }

    /// Handle an address-control command from the socket or command ring.
    fn process_cmd(
        &self,
        hdr: CmdHdr,
        tx: Option<OwnedFd>,
        rx: Option<OwnedFd>,
    ) -> Result<()> {
        log::debug!(
            "processing {:?} cmd from {}-{} (pair {})",
            hdr.kind,
            hdr.pid,
            hdr.id,
            hdr.pair_idx
        );
        let key = AddrKey {
            pid: hdr.pid,
            id: hdr.id,
        };

        match hdr.kind {
            CmdKind::Reserved => {
                let region = self.source()?.region().ok_or(NaError::ProtocolError)?;

                let addr = SmAddr::new(self.weak_self.clone(), key, None, true, false);
                addr.set_pair_idx(hdr.pair_idx);
                *addr.region.lock() = Some(region);
                addr.set_status(ADDR_RESERVED);

                // Swap descriptors: the peer's tx is our rx.
                {
                    let mut fds = addr.fds.lock();
                    fds.tx = rx.map(|fd| Arc::new(Notifier::from_received(fd)));
                    fds.rx = tx.map(|fd| Arc::new(Notifier::from_received(fd)));
                }
                let rx_notifier = addr.fds.lock().rx.clone();
                if let (Some(_), Some(rx_notifier)) = (&self.poller, rx_notifier) {
                    let token = self
                        .register_poll(rx_notifier.as_raw_fd(), PollTarget::RxNotify(Arc::downgrade(&addr)))?;
                    addr.fds.lock().rx_token = Some(token);
                }

                // Passive-side addresses are resolved from the start.
                addr.set_status(ADDR_RESOLVED);
                self.poll_addrs.lock().push(addr);
            }
            CmdKind::Released => {
                let found = {
                    let list = self.poll_addrs.lock();
                    list.iter()
                        .find(|a| a.unexpected && a.key == key && a.pair_idx() == hdr.pair_idx)
                        .cloned()
                };
                match found {
                    // Drop the reference owned by the connection.
                    Some(addr) => addr.ref_decr(),
                    None => log::debug!(
                        "no address found for released cmd (pid={}, id={}, pair={})",
                        hdr.pid,
                        hdr.id,
                        hdr.pair_idx
                    ),
                }
            }
        }
        Ok(())
    }

    /// Receive pending control messages from the socket.
    fn progress_sock(&self) -> Result<bool> {
        let Some(sock) = self.sock_fd() else {
            return Ok(false);
        };
        let Some((raw, tx, rx)) = event_recv(sock)? else {
            return Ok(false);
        };
        if tx.is_some() {
            self.nofile_incr();
        }
        if rx.is_some() {
            self.nofile_incr();
        }
        let hdr = CmdHdr::from_raw(raw).ok_or(NaError::ProtocolError)?;
        self.process_cmd(hdr, tx, rx)?;
        Ok(true)
    }

    /// Non-blocking progress: rx rings of every polled address, then the
    /// command ring.
    fn progress(&self) -> Result<u32> {
        let addrs: Vec<Arc<SmAddr>> = self.poll_addrs.lock().clone();
        let mut count = 0;
        for addr in &addrs {
            if self.progress_rx_queue(addr)? {
                count += 1;
            }
        }

        if let Some(region) = self.source_addr.get().and_then(|s| s.region()) {
            if let Some(raw) = region.cmd_ring().pop() {
                let hdr = CmdHdr::from_raw(raw).ok_or(NaError::ProtocolError)?;
                self.process_cmd(hdr, None, None)?;
                count += 1;
            }
        }

        Ok(count)
    }

    /// Blocking progress through the poll set.
    fn progress_wait(&self, ctx: &Context, timeout_ms: u32) -> Result<u32> {
        let poller = self.poller.as_ref().ok_or(NaError::OpNotSupported)?;
        let sm_ctx = ctx
            .plugin_context()
            .as_any()
            .downcast_ref::<SmContext>()
            .ok_or(NaError::InvalidArg)?;

        let mut events = sm_ctx.events.lock().unwrap();
        poller.wait(&mut events, MAX_EVENTS, timeout_ms.min(i32::MAX as u32) as i32)?;

        let mut count = 0;
        for event in events.iter() {
            let target = self.poll_targets.lock().get(&event.token).cloned();
            let progressed = match target {
                // Raced with a deregistration; stale wakeup.
                None => false,
                Some(PollTarget::Sock) => self.progress_sock()?,
                Some(PollTarget::TxNotify(weak)) => match weak.upgrade() {
                    Some(addr) => {
                        // Local completion notification only.
                        let tx = addr.fds.lock().tx.clone();
                        match tx {
                            Some(tx) => tx.ack()?,
                            None => false,
                        }
                    }
                    None => false,
                },
                Some(PollTarget::RxNotify(weak)) => match weak.upgrade() {
                    Some(addr) => {
                        let rx = addr.fds.lock().rx.clone();
                        let notified = match rx {
                            Some(rx) => rx.ack()?,
                            None => false,
                        };
                        let progressed_rx = self.progress_rx_queue(&addr)?;
                        notified | progressed_rx
                    }
                    None => false,
                },
            };
            if progressed {
                count += 1;
            }
        }

        Ok(count)
    }

    /// Plugin `poll`: one non-blocking progress pass plus retries.
    pub(crate) fn poll(&self, ctx: &Context) -> Result<u32> {
        let count = if self.poller.is_some() {
            self.progress_wait(ctx, 0)?
        } else {
            self.progress()?
        };
        self.process_retries()?;
        Ok(count)
    }

    /// Plugin `poll_wait`: progress until an event lands or the deadline
    /// passes.
    pub(crate) fn poll_wait(&self, ctx: &Context, timeout_ms: u32) -> Result<u32> {
        let deadline = Instant::now() + Duration::from_millis(u64::from(timeout_ms));
        loop {
            let remaining = if timeout_ms == 0 {
                Duration::ZERO
            } else {
                deadline.saturating_duration_since(Instant::now())
            };

            let count = if self.poller.is_some() {
                self.progress_wait(ctx, remaining.as_millis() as u32)?
            } else {
                self.progress()?
            };
            self.process_retries()?;

            if count > 0 {
                return Ok(count);
            }
            if Instant::now() >= deadline {
                return Err(NaError::Timeout);
            }
        }
    }

    /// Whether a `poll_wait` caller may safely block on the poll set.
    pub(crate) fn poll_try_wait(&self) -> bool {
        {
            let addrs = self.poll_addrs.lock();
            for addr in addrs.iter() {
                if let Some(region) = addr.region() {
                    if !addr.rx_ring(&region).is_empty() {
                        return false;
                    }
                }
            }
        }
        self.retry_ops.lock().is_empty()
    }

    pub(crate) fn poll_fd(&self) -> Option<RawFd> {
        self.poller.as_ref().map(|p| p.as_raw_fd())
    }

    /// Cancel a queued operation; in-flight ones complete naturally.
    pub(crate) fn cancel(&self, op: &OpId) -> Result<()> {
        let sm_op = op.downcast_arc::<SmOp>().ok_or(NaError::InvalidArg)?;

        let status = sm_op.status();
        if status & (OP_COMPLETED | OP_ERRORED | OP_CANCELED) != 0 {
            return Ok(());
        }

        let kind = sm_op.state.lock().kind;
        let queue = match kind {
            OpKind::RecvUnexpected => Some(&self.unexpected_ops),
            OpKind::RecvExpected => Some(&self.expected_ops),
            OpKind::SendUnexpected | OpKind::SendExpected => Some(&self.retry_ops),
            // One-sided transfers complete within the submit call.
            OpKind::Put | OpKind::Get => None,
        };

        if let Some(queue) = queue {
            let canceled = {
                let mut q = queue.lock();
                if sm_op.status() & OP_QUEUED != 0 {
                    sm_op.set_status(OP_CANCELED);
                    // A send being retried right now is canceled by the
                    // retry loop instead.
                    if sm_op.status() & OP_RETRYING == 0 {
                        if let Some(pos) = q.iter().position(|o| Arc::ptr_eq(o, &sm_op)) {
                            q.remove(pos);
                        }
                        sm_op.clear_status(OP_QUEUED);
                        true
                    } else {
                        false
                    }
                } else {
                    false
                }
            };
            if canceled {
                sm_op.complete(Err(NaError::Canceled));
                self.complete_signal();
            }
        }

        Ok(())
    }

    /// Complete an operation inline and wake local waiters.
    pub(crate) fn complete_inline(&self, op: &Arc<SmOp>, ret: Result<()>) {
        op.complete(ret);
        self.complete_signal();
    }
}
