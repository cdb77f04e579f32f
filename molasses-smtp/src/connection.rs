//! Per-connection state: initialisation, the stutter read/write
//! handlers, the protocol dispatcher, and rejection assembly.

use std::{borrow::Cow, io, net::SocketAddr, sync::Arc};

use tokio::net::TcpStream;

use molasses_common::{config::Config, record::Record};
use molasses_net::Blacklist;

use crate::{state::State, table::Counts};

/// Fixed input buffer per slot.
pub const IN_BUF_SIZE: usize = 8192;
/// Output buffer reservation per session.
pub const OUT_BUF_SIZE: usize = 8192;
/// Unrecognised commands tolerated before the reply is forced.
pub const MAX_BAD_CMD: u32 = 20;
/// Headroom under capacity below which stuttering switches to bulk
/// writes, so a nearly-full table degrades by punishing less.
pub const CLIENT_TOLERANCE: usize = 5;

const SUMMARY_SIZE: usize = 80;
const SUMMARY_ETC: &str = " ...";

/// Everything the dispatcher needs besides the slot itself. `records`
/// collects grey tuples for the event loop to forward; the dispatcher
/// itself never touches the grey pipe.
pub struct StateCtx<'a> {
    pub counts: &'a mut Counts,
    pub config: &'a Config,
    pub records: &'a mut Vec<Record>,
}

pub struct Connection {
    stream: Option<TcpStream>,
    src_addr: String,
    dst_addr: String,
    helo: String,
    mail: String,
    rcpt: String,

    pub state: State,
    last_state: State,

    /// Blacklists containing this peer.
    pub blacklists: Vec<Arc<Blacklist>>,
    /// Printable summary of the above, capped for the log line.
    pub lists: Option<String>,

    /// Next read-eligible time; 0 disarms the gate.
    pub r_time: i64,
    /// Next write-eligible time; 0 disarms the gate.
    pub w_time: i64,
    /// Session start.
    pub s_time: i64,

    in_buf: Box<[u8]>,
    in_len: usize,
    /// Any of these bytes in the input completes a read.
    r_end_chars: String,

    out_buf: Vec<u8>,
    out_pos: usize,

    stutter: i64,
    data_lines: u32,
    data_body: bool,
    bad_cmd: u32,
    seen_cr: bool,
}

impl Default for Connection {
    fn default() -> Self {
        Self {
            stream: None,
            src_addr: String::new(),
            dst_addr: String::new(),
            helo: String::new(),
            mail: String::new(),
            rcpt: String::new(),
            state: State::BannerSent,
            last_state: State::BannerSent,
            blacklists: Vec::new(),
            lists: None,
            r_time: 0,
            w_time: 0,
            s_time: 0,
            in_buf: vec![0; IN_BUF_SIZE].into_boxed_slice(),
            in_len: 0,
            r_end_chars: String::new(),
            out_buf: Vec::new(),
            out_pos: 0,
            stutter: 0,
            data_lines: 0,
            data_body: false,
            bad_cmd: 0,
            seen_cr: false,
        }
    }
}

impl Connection {
    pub fn is_free(&self) -> bool {
        self.stream.is_none()
    }

    pub fn src_addr(&self) -> &str {
        &self.src_addr
    }

    /// Output still owed to the peer.
    pub fn pending_output(&self) -> &[u8] {
        &self.out_buf[self.out_pos..]
    }

    /// Take over this slot for a fresh session: release the previous
    /// session's storage, zero the mutable fields, write the banner,
    /// attach matching blacklists, and derive the stutter.
    #[allow(clippy::cast_possible_wrap)]
    pub fn init(
        &mut self,
        stream: Option<TcpStream>,
        peer: SocketAddr,
        dst_addr: String,
        counts: &mut Counts,
        blacklists: &[Arc<Blacklist>],
        config: &Config,
        now: i64,
    ) {
        self.reset();

        self.stream = stream;
        self.src_addr = peer.ip().to_string();
        self.dst_addr = dst_addr;
        self.s_time = now;
        self.r_end_chars.push('\n');

        let human_time = chrono::Local::now().format("%a %b %e %H:%M:%S %Y");
        self.out_buf.reserve(OUT_BUF_SIZE);
        self.out_buf.extend_from_slice(
            format!(
                "220 {} ESMTP {}; {}\r\n",
                config.hostname, config.banner, human_time
            )
            .as_bytes(),
        );

        self.blacklists = blacklists
            .iter()
            .filter(|list| list.matches(peer.ip()))
            .cloned()
            .collect();

        self.stutter =
            if config.grey.enable && config.grey.stutter == 0 && self.blacklists.is_empty() {
                0
            } else {
                config.stutter as i64
            };

        counts.clients += 1;
        if !self.blacklists.is_empty() {
            counts.black_clients += 1;
            self.lists = Some(self.summarize_lists());

            // The admission-control valve: too many stuttered clients
            // and the punishment stops so the table keeps turning over.
            if counts.black_clients > config.max_black {
                self.stutter = 0;
            }
        }

        self.w_time = now + self.stutter;
    }

    /// Drop the socket and release the session's transient storage.
    pub fn close(&mut self, counts: &mut Counts, now: i64) {
        self.stream = None;

        tracing::info!(
            "{}: disconnected after {} seconds.{}{}",
            self.src_addr,
            now - self.s_time,
            if self.lists.is_some() { " lists:" } else { "" },
            self.lists.as_deref().unwrap_or(""),
        );

        if !self.blacklists.is_empty() {
            counts.black_clients -= 1;
        }
        self.blacklists.clear();
        self.lists = None;

        self.out_buf = Vec::new();
        self.out_pos = 0;
        self.r_time = 0;
        self.w_time = 0;

        counts.clients -= 1;
    }

    fn reset(&mut self) {
        self.stream = None;
        self.src_addr.clear();
        self.dst_addr.clear();
        self.helo.clear();
        self.mail.clear();
        self.rcpt.clear();
        self.state = State::BannerSent;
        self.last_state = State::BannerSent;
        self.blacklists.clear();
        self.lists = None;
        self.r_time = 0;
        self.w_time = 0;
        self.s_time = 0;
        self.in_len = 0;
        self.r_end_chars.clear();
        self.out_buf = Vec::new();
        self.out_pos = 0;
        self.stutter = 0;
        self.data_lines = 0;
        self.data_body = false;
        self.bad_cmd = 0;
        self.seen_cr = false;
    }

    /// Pull whatever the socket has, and dispatch once the input holds a
    /// terminator or the buffer is full. Trailing CR/LF are trimmed
    /// before the dispatcher sees the line.
    pub fn handle_read(&mut self, now: i64, ctx: &mut StateCtx) {
        let mut end = false;

        if self.r_time != 0 {
            let Some(stream) = self.stream.as_ref() else {
                return;
            };

            let space = &mut self.in_buf[self.in_len..];
            if !space.is_empty() {
                match stream.try_read(space) {
                    Ok(0) => {
                        self.close(ctx.counts, now);
                        return;
                    }
                    Ok(n) => {
                        let newly = &self.in_buf[self.in_len..self.in_len + n];
                        if self
                            .r_end_chars
                            .bytes()
                            .any(|terminator| newly.contains(&terminator))
                        {
                            end = true;
                        }
                        self.in_len += n;
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                    Err(err) => {
                        tracing::warn!("connection read error: {err}");
                        self.close(ctx.counts, now);
                        return;
                    }
                }
            }
        }

        if end || self.in_len == self.in_buf.len() {
            while self.in_len > 0 && matches!(self.in_buf[self.in_len - 1], b'\r' | b'\n') {
                self.in_len -= 1;
            }
            self.r_time = 0;
            self.next_state(now, ctx);
        }
    }

    /// Emit pending output under the stutter regime: one byte at a time
    /// while stuttering and the table has headroom, the whole remainder
    /// otherwise. A `\r` is supplied before any `\n` the buffer owes.
    pub fn handle_write(&mut self, now: i64, ctx: &mut StateCtx) {
        #[allow(clippy::cast_possible_wrap)]
        let grey_stutter = ctx.config.grey.stutter as i64;

        // Greylisted connections are only punished for the first while;
        // a legitimate retry should not crawl forever.
        if self.stutter != 0
            && ctx.config.grey.enable
            && self.blacklists.is_empty()
            && now - self.s_time > grey_stutter
        {
            self.stutter = 0;
        }

        if self.w_time != 0 {
            let Some(stream) = self.stream.as_ref() else {
                return;
            };

            if self.out_buf.get(self.out_pos) == Some(&b'\n') && !self.seen_cr {
                match stream.try_write(b"\r") {
                    Ok(0) => {
                        self.close(ctx.counts, now);
                        return;
                    }
                    Ok(_) => {}
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                    Err(err) => {
                        tracing::warn!("connection write error: {err}");
                        self.close(ctx.counts, now);
                        return;
                    }
                }
            }

            let within_max = ctx.counts.clients + CLIENT_TOLERANCE < ctx.counts.capacity;
            let remaining = &self.out_buf[self.out_pos..];
            let chunk = if within_max && self.stutter != 0 && !remaining.is_empty() {
                &remaining[..1]
            } else {
                remaining
            };

            match stream.try_write(chunk) {
                Ok(0) => {
                    self.close(ctx.counts, now);
                    return;
                }
                Ok(n) => {
                    self.seen_cr = self.out_buf[self.out_pos + n - 1] == b'\r';
                    self.out_pos += n;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    tracing::warn!("connection write error: {err}");
                    self.close(ctx.counts, now);
                    return;
                }
            }
        }

        self.w_time = now + self.stutter;
        if self.out_pos >= self.out_buf.len() {
            self.w_time = 0;
            self.next_state(now, ctx);
        }
    }

    /// The dispatcher: advance the state machine on completed input or
    /// drained output.
    pub fn next_state(&mut self, now: i64, ctx: &mut StateCtx) {
        let line = self.line().into_owned();

        if matches_verb(&line, "QUIT") && self.state < State::Close {
            self.set_output(format!("221 {}\r\n", ctx.config.hostname));
            self.w_time = now + self.stutter;
            self.last_state = self.state;
            self.state = State::Close;
            return;
        }

        if matches_verb(&line, "RSET")
            && self.state > State::HeloOut
            && self.state < State::DataIn
        {
            self.set_output("250 OK\r\n");
            self.w_time = now + self.stutter;
            self.last_state = self.state;
            self.state = State::HeloOut;
            return;
        }

        match self.state {
            State::BannerSent => self.arm_read(now, State::HeloIn),

            State::HeloIn => self.on_helo(&line, now, ctx),

            State::HeloOut => self.arm_read(now, State::MailIn),

            State::MailIn => self.on_mail(&line, now, ctx),

            State::MailOut => self.arm_read(now, State::RcptIn),

            State::RcptIn => self.on_rcpt(&line, now, ctx),

            // Back for more recipients.
            State::RcptOut => self.arm_read(now, State::RcptIn),

            State::DataIn => self.on_data(&line, now, ctx),

            State::DataOut => self.arm_read(now, State::Message),

            State::Message => self.on_message_body(now, ctx),

            State::Reply => self.enter_reply(now, ctx),

            State::Close => self.close(ctx.counts, now),
        }
    }

    fn on_helo(&mut self, line: &str, now: i64, ctx: &mut StateCtx) {
        if matches_verb(line, "HELO") || matches_verb(line, "EHLO") {
            self.helo = helo_arg(line);

            let next = if self.helo.is_empty() {
                let verb = if matches_verb(line, "HELO") { "HELO" } else { "EHLO" };
                self.set_output(format!("501 Syntax: {verb} hostname\r\n"));
                State::BannerSent
            } else {
                self.set_output(format!("250 {}\r\n", ctx.config.hostname));
                State::HeloOut
            };

            self.last_state = self.state;
            self.state = next;
            self.w_time = now + self.stutter;
            return;
        }

        self.on_mail(line, now, ctx);
    }

    fn on_mail(&mut self, line: &str, now: i64, ctx: &mut StateCtx) {
        if matches_verb(line, "MAIL") {
            self.mail = addr_arg(line);
            self.set_output("250 OK\r\n");
            self.last_state = self.state;
            self.state = State::MailOut;
            self.w_time = now + self.stutter;
            return;
        }

        self.on_rcpt(line, now, ctx);
    }

    fn on_rcpt(&mut self, line: &str, now: i64, ctx: &mut StateCtx) {
        if matches_verb(line, "RCPT") {
            self.rcpt = addr_arg(line);
            self.set_output("250 OK\r\n");
            self.last_state = self.state;
            self.state = State::RcptOut;
            self.w_time = now + self.stutter;

            if !self.mail.is_empty() && !self.rcpt.is_empty() {
                let verdict = if self.blacklists.is_empty() { "GREY" } else { "BLACK" };
                tracing::debug!(
                    "({verdict}) {}: {} -> {}",
                    self.src_addr,
                    self.mail,
                    self.rcpt
                );
                if ctx.config.verbose {
                    tracing::info!(
                        "({verdict}) {}: {} -> {}",
                        self.src_addr,
                        self.mail,
                        self.rcpt
                    );
                }

                if ctx.config.grey.enable && self.blacklists.is_empty() {
                    ctx.records.push(Record::Grey {
                        dst_ip: self.dst_addr.clone(),
                        ip: self.src_addr.clone(),
                        helo: self.helo.clone(),
                        from: self.mail.clone(),
                        to: self.rcpt.clone(),
                    });
                }
            }
            return;
        }

        self.on_data(line, now, ctx);
    }

    fn on_data(&mut self, line: &str, now: i64, ctx: &mut StateCtx) {
        if matches_verb(line, "DATA") {
            self.set_output("354 End data with <CR><LF>.<CR><LF>\r\n");
            self.state = State::DataOut;
            self.clamp_window(ctx.config.window);
            self.in_len = 0;
            self.w_time = now + self.stutter;

            // A greylisted client's verdict is already known; skip the
            // body and reply now.
            if ctx.config.grey.enable && self.blacklists.is_empty() {
                self.last_state = self.state;
                self.state = State::Reply;
                self.enter_reply(now, ctx);
            }
            return;
        }

        if matches_verb(line, "NOOP") {
            self.set_output("250 OK\r\n");
        } else {
            self.set_output("500 Command unrecognized\r\n");
            self.bad_cmd += 1;
            if self.bad_cmd > MAX_BAD_CMD {
                self.last_state = self.state;
                self.state = State::Reply;
                self.enter_reply(now, ctx);
                return;
            }
        }

        self.state = self.last_state;
        self.in_len = 0;
        self.w_time = now + self.stutter;
    }

    /// Walk the body lines: a lone dot ends the session, as does the
    /// tenth line after the header separator. Nobody reads the rest.
    fn on_message_body(&mut self, now: i64, ctx: &mut StateCtx) {
        let mut data_body = self.data_body;
        let mut data_lines = self.data_lines;
        let mut done = false;

        for raw in self.in_buf[..self.in_len].split(|byte| *byte == b'\n') {
            let line = match raw.last() {
                Some(b'\r') => &raw[..raw.len() - 1],
                _ => raw,
            };

            if line == b"." || (data_body && {
                data_lines += 1;
                data_lines >= 10
            }) {
                done = true;
                break;
            }

            if !data_body && line.is_empty() {
                data_body = true;
            }
        }

        self.data_body = data_body;
        self.data_lines = data_lines;

        if done {
            self.last_state = self.state;
            self.state = State::Reply;
            self.enter_reply(now, ctx);
            return;
        }

        self.in_len = 0;
        self.r_time = now;
    }

    fn enter_reply(&mut self, now: i64, ctx: &StateCtx) {
        self.build_reply(&ctx.config.error_code);
        self.w_time = now + self.stutter;
        self.last_state = self.state;
        self.state = State::Close;
    }

    /// Assemble one SMTP reply per matching blacklist, dash-continued on
    /// every line except the very last, with the `%A` and `\n` escapes
    /// expanded. Without a match, the fixed greylisting deferral.
    pub fn build_reply(&mut self, error_code: &str) {
        if self.blacklists.is_empty() {
            self.set_output("451 Temporary failure, please try again later.\r\n");
            return;
        }

        let mut text = String::new();
        for list in &self.blacklists {
            text.push_str(&expand_message(&list.message, &self.src_addr));
            if !text.ends_with('\n') {
                text.push('\n');
            }
        }

        let lines: Vec<&str> = text.lines().collect();
        let last = lines.len().saturating_sub(1);
        let mut out = String::new();
        for (at, line) in lines.iter().enumerate() {
            out.push_str(error_code);
            out.push(if at == last { ' ' } else { '-' });
            out.push_str(line);
            out.push('\n');
        }

        self.set_output(out);
    }

    fn arm_read(&mut self, now: i64, next: State) {
        self.in_len = 0;
        self.last_state = self.state;
        self.state = next;
        self.r_time = now;
    }

    fn set_output(&mut self, out: impl AsRef<[u8]>) {
        self.out_buf.clear();
        self.out_buf.extend_from_slice(out.as_ref());
        self.out_pos = 0;
    }

    fn line(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.in_buf[..self.in_len])
    }

    fn summarize_lists(&self) -> String {
        let mut lists = String::new();
        let budget = SUMMARY_SIZE - SUMMARY_ETC.len();

        for list in &self.blacklists {
            if lists.len() + list.name.len() + 1 >= budget {
                lists.push_str(SUMMARY_ETC);
                break;
            }
            if !lists.is_empty() {
                lists.push(' ');
            }
            lists.push_str(&list.name);
        }

        lists
    }

    /// Shrink the receive window during DATA so the peer spends longer
    /// pushing a body nobody will read. Failure is not worth a session.
    fn clamp_window(&self, window: u32) {
        if window == 0 {
            return;
        }
        if let Some(stream) = self.stream.as_ref() {
            let sock = socket2::SockRef::from(stream);
            if let Err(err) = sock.set_recv_buffer_size(window as usize) {
                tracing::debug!("setsockopt failed, window size of {window}: {err}");
            }
        }
    }
}

fn matches_verb(line: &str, verb: &str) -> bool {
    line.len() >= verb.len() && line.as_bytes()[..verb.len()].eq_ignore_ascii_case(verb.as_bytes())
}

/// The hostname argument of a HELO/EHLO line.
fn helo_arg(line: &str) -> String {
    line.get(4..)
        .unwrap_or("")
        .trim_start_matches([' ', '\t'])
        .split([' ', '\t'])
        .next()
        .unwrap_or("")
        .to_owned()
}

/// The address argument of a MAIL/RCPT line: everything after the first
/// colon up to whitespace, brackets and all.
fn addr_arg(line: &str) -> String {
    match line.split_once(':') {
        None => String::new(),
        Some((_, rest)) => rest
            .trim_start_matches([' ', '\t'])
            .split([' ', '\t'])
            .next()
            .unwrap_or("")
            .to_owned(),
    }
}

/// Expand a blacklist message: `%A` becomes the peer address, `\n` a
/// newline; doubled `%` and `\` produce the literal character.
fn expand_message(format: &str, src_addr: &str) -> String {
    let mut out = String::new();
    let mut saved: Option<char> = None;

    for c in format.chars() {
        match c {
            '\\' | '%' => {
                if let Some(s) = saved.take() {
                    out.push(s);
                } else {
                    saved = Some(c);
                }
            }
            'A' if saved == Some('%') => {
                out.push_str(src_addr);
                saved = None;
            }
            'n' if saved == Some('\\') => {
                out.push('\n');
                saved = None;
            }
            _ => {
                if let Some(s) = saved.take() {
                    out.push(s);
                }
                out.push(c);
            }
        }
    }

    out
}
