// SPDX-License-Identifier: GPL-2.0-or-later

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use tracing::{debug, info};

use crate::console::{ConsoleIo, Pattern, RawModeGuard, DEFAULT_READ_TIMEOUT};
use crate::error::{Error, Result};
use crate::interp::{HostFn, Interp, InterpError, Value};
use crate::logging::SessionLog;

/// Bridges the controlling terminal and the guest console.
///
/// Batch mode (boot commands present) runs the interpreter against the
/// console while a cooperative pump thread forwards keystrokes; interactive
/// mode is a raw pass-through until EOF.
pub struct Terminal {
    shared: Rc<Shared>,
}

struct Shared {
    console: RefCell<ConsoleIo>,
    pump: RefCell<Option<Pump>>,
}

struct Pump {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Shared {
    fn stop_pump(&self) {
        if let Some(pump) = self.pump.borrow_mut().take() {
            pump.running.store(false, Ordering::Relaxed);
            let _ = pump.handle.join();
        }
        self.console.borrow_mut().clear_pump();
    }
}

fn host_err(err: Error) -> InterpError {
    match err {
        Error::Interrupted => InterpError::Interrupted,
        other => InterpError::Host(other.to_string()),
    }
}

impl Terminal {
    /// Must run attached to a terminal; registers the SIGWINCH handler.
    pub fn new(
        console: UnixStream,
        log: SessionLog,
        interrupt: Arc<AtomicBool>,
    ) -> Result<Terminal> {
        if !nix::unistd::isatty(0).unwrap_or(false) {
            return Err(Error::Other(
                "qemu-compose must run in a UNIX 98 style pty/tty".to_string(),
            ));
        }

        let winch = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(signal_hook::consts::SIGWINCH, winch.clone())
            .map_err(Error::Io)?;

        let console = ConsoleIo::new(console, log, interrupt, winch)?;

        Ok(Terminal {
            shared: Rc::new(Shared {
                console: RefCell::new(console),
                pump: RefCell::new(None),
            }),
        })
    }

    /// Interpret the boot command program against the console, terminal in
    /// raw mode, keystrokes pumped through to the guest.
    pub fn run_batch(
        &self,
        cmds: &[serde_json::Value],
        env: &BTreeMap<String, String>,
    ) -> Result<()> {
        let _raw = RawModeGuard::set(0)?;
        self.start_pump();

        let result = self.run_program(cmds, env);

        self.shared.stop_pump();
        result
    }

    fn run_program(
        &self,
        cmds: &[serde_json::Value],
        env: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut interp = Interp::new();
        let root = interp.root();

        interp.define(
            root,
            "read_until",
            Value::Host(Rc::new(ReadUntilFn(self.shared.clone()))),
        );
        interp.define(root, "write", Value::Host(Rc::new(WriteFn(self.shared.clone()))));
        interp.define(
            root,
            "writeline",
            Value::Host(Rc::new(WritelineFn(self.shared.clone()))),
        );
        interp.define(root, "wait", Value::Host(Rc::new(WaitFn(self.shared.clone()))));
        interp.define(root, "RegExp", Value::Host(Rc::new(RegExpFn)));
        interp.define(
            root,
            "interact",
            Value::Host(Rc::new(InteractFn(self.shared.clone()))),
        );

        // numeric environment entries stay numbers inside scripts
        for (key, value) in env {
            let bound = match key.as_str() {
                "TERM_ROWS" | "TERM_COLS" | "HTTP_PORT" => value
                    .parse::<i64>()
                    .map(Value::Int)
                    .unwrap_or_else(|_| Value::Str(value.clone())),
                _ => Value::Str(value.clone()),
            };
            interp.define(root, key, bound);
        }

        debug!("run_batch: {} boot commands", cmds.len());

        let mut program = vec![Value::Str("begin".to_string())];
        program.extend(cmds.iter().map(Value::from_json));

        match interp.eval(&Value::List(program), root) {
            Ok(_) => Ok(()),
            Err(InterpError::Interrupted) => Err(Error::Interrupted),
            Err(err) => Err(Error::Interpreter(err)),
        }
    }

    /// Hand the terminal over to the user until EOF or quit.
    pub fn interact(&self, raw_mode: bool) -> Result<()> {
        self.shared.stop_pump();
        self.shared.console.borrow_mut().interactive(raw_mode)
    }

    fn start_pump(&self) {
        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = channel();
        self.shared.console.borrow_mut().set_pump(rx);

        let flag = running.clone();
        let handle = std::thread::spawn(move || pump_loop(flag, tx));

        *self.shared.pump.borrow_mut() = Some(Pump { running, handle });
    }
}

impl Drop for Terminal {
    fn drop(&mut self) {
        self.shared.stop_pump();
    }
}

/// Non-blocking 200 ms poll on the controlling terminal, forwarding
/// keystrokes to the console write side.
fn pump_loop(running: Arc<AtomicBool>, tx: Sender<Vec<u8>>) {
    info!("terminal input pump started");

    while running.load(Ordering::Relaxed) {
        let readable = {
            let stdin_fd = unsafe { std::os::fd::BorrowedFd::borrow_raw(0) };
            let mut fds = [PollFd::new(&stdin_fd, PollFlags::POLLIN)];
            match poll(&mut fds, 200) {
                Ok(n) => n > 0,
                Err(Errno::EINTR) => false,
                Err(_) => break,
            }
        };

        if !readable {
            continue;
        }

        let mut buf = [0u8; 1024];
        match nix::unistd::read(0, &mut buf) {
            Ok(0) => break,
            Ok(n) => {
                debug!("terminal input pump received {n} bytes");
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => {}
            Err(_) => break,
        }
    }

    info!("terminal input pump finished");
}

fn arg_bytes(name: &str, args: &[Value]) -> std::result::Result<Vec<u8>, InterpError> {
    match args.first() {
        Some(Value::Str(s)) => Ok(s.clone().into_bytes()),
        Some(other) => Ok(other.display().into_bytes()),
        None => Err(InterpError::Arity {
            name: name.to_string(),
            expected: 1,
            got: 0,
        }),
    }
}

struct ReadUntilFn(Rc<Shared>);

impl HostFn for ReadUntilFn {
    fn name(&self) -> &str {
        "read_until"
    }

    fn call(&self, args: Vec<Value>) -> std::result::Result<Value, InterpError> {
        let pattern = match args.first() {
            Some(Value::Regex(re)) => Pattern::Regex(re.clone()),
            Some(Value::Str(s)) => Pattern::Literal(s.clone().into_bytes()),
            Some(other) => {
                return Err(InterpError::Type(format!("read_until: {other:?}")))
            }
            None => {
                return Err(InterpError::Arity {
                    name: "read_until".to_string(),
                    expected: 1,
                    got: 0,
                })
            }
        };

        let data = self
            .0
            .console
            .borrow_mut()
            .read_until(&pattern, DEFAULT_READ_TIMEOUT)
            .map_err(host_err)?;
        Ok(Value::Str(String::from_utf8_lossy(&data).into_owned()))
    }
}

struct WriteFn(Rc<Shared>);

impl HostFn for WriteFn {
    fn name(&self) -> &str {
        "write"
    }

    fn call(&self, args: Vec<Value>) -> std::result::Result<Value, InterpError> {
        let data = arg_bytes("write", &args)?;
        self.0.console.borrow_mut().write(&data).map_err(host_err)?;
        Ok(Value::Null)
    }
}

struct WritelineFn(Rc<Shared>);

impl HostFn for WritelineFn {
    fn name(&self) -> &str {
        "writeline"
    }

    fn call(&self, args: Vec<Value>) -> std::result::Result<Value, InterpError> {
        let data = arg_bytes("writeline", &args)?;
        self.0
            .console
            .borrow_mut()
            .writeline(&data)
            .map_err(host_err)?;
        Ok(Value::Null)
    }
}

struct WaitFn(Rc<Shared>);

impl HostFn for WaitFn {
    fn name(&self) -> &str {
        "wait"
    }

    fn call(&self, args: Vec<Value>) -> std::result::Result<Value, InterpError> {
        let secs = match args.first() {
            Some(Value::Int(n)) => *n as f64,
            Some(Value::Float(n)) => *n,
            other => {
                return Err(InterpError::Type(format!("wait: {other:?}")))
            }
        };

        let data = self
            .0
            .console
            .borrow_mut()
            .read_until_timeout(std::time::Duration::from_secs_f64(secs.max(0.0)))
            .map_err(host_err)?;
        Ok(Value::Str(String::from_utf8_lossy(&data).into_owned()))
    }
}

struct RegExpFn;

impl HostFn for RegExpFn {
    fn name(&self) -> &str {
        "RegExp"
    }

    fn call(&self, args: Vec<Value>) -> std::result::Result<Value, InterpError> {
        match args.first() {
            Some(Value::Str(s)) => regex::bytes::Regex::new(s)
                .map(|re| Value::Regex(Rc::new(re)))
                .map_err(|e| InterpError::Host(format!("RegExp: {e}"))),
            other => Err(InterpError::Type(format!("RegExp: {other:?}"))),
        }
    }
}

struct InteractFn(Rc<Shared>);

impl HostFn for InteractFn {
    fn name(&self) -> &str {
        "interact"
    }

    fn call(&self, _args: Vec<Value>) -> std::result::Result<Value, InterpError> {
        self.0.stop_pump();
        self.0
            .console
            .borrow_mut()
            .interactive(false)
            .map_err(host_err)?;
        Ok(Value::Null)
    }
}
