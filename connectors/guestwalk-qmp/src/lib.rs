/*!
Ground truth connector speaking the QEMU machine protocol (QMP).

QMP is a line based JSON protocol. After connecting the server sends a greeting, the client
has to negotiate capabilities with `qmp_capabilities` before any other command is accepted.
Replies carry either a `return` or an `error` member. Asynchronous `event` messages can show
up at any time and are skipped.

The register state is queried with `query-kernel-info`, which is provided by introspection
enabled QEMU builds:

```text
-> {"execute": "query-kernel-info", "arguments": {"cpu-index": 0}}
<- {"return": {"ttbr0": "0x4a8c1000", "ttbr1": "0x41d10000", "current-task": "0xffff00000a1e8000"}}
```

Register values are accepted as JSON integers or as hex strings.

# Examples

```no_run
use guestwalk::connector::CpuState;
use guestwalk_qmp::QmpClient;

let mut client = QmpClient::connect("127.0.0.1:4444").unwrap();
let registers = client.translation_registers(0).unwrap();
println!("kernel root: {}", registers.kernel_root());
```
*/

use guestwalk::connector::{ConnectorArgs, CpuState, TranslationRegisters};
use guestwalk::error::{Error, ErrorKind, ErrorOrigin, Result};
use guestwalk::types::{PhysicalAddress, VirtualAddress};

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::{debug, info, trace};
use serde::Deserialize;
use serde_json::{json, Value};

/// Read timeout of the TCP connection.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Number of asynchronous events tolerated in front of a reply.
const MAX_SKIPPED_EVENTS: usize = 256;

#[derive(Debug, Deserialize)]
struct Greeting {
    #[serde(rename = "QMP")]
    qmp: GreetingInfo,
}

#[derive(Debug, Deserialize)]
struct GreetingInfo {
    version: VersionInfo,
    #[serde(default)]
    capabilities: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct VersionInfo {
    qemu: QemuVersion,
    #[serde(default)]
    package: String,
}

#[derive(Debug, Deserialize)]
struct QemuVersion {
    major: u32,
    minor: u32,
    micro: u32,
}

#[derive(Debug, Deserialize)]
struct QmpError {
    class: String,
    desc: String,
}

/// Register state of one virtual cpu as reported by `query-kernel-info`.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct KernelInfo {
    pub ttbr0: Option<u64>,
    pub ttbr1: Option<u64>,
    pub cr3: Option<u64>,
    pub current_task: Option<VirtualAddress>,
}

impl KernelInfo {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(Self {
            ttbr0: register(value, "ttbr0")?,
            ttbr1: register(value, "ttbr1")?,
            cr3: register(value, "cr3")?,
            current_task: register(value, "current-task")?.map(VirtualAddress::from),
        })
    }

    /// Returns the translation registers of whichever architecture was reported.
    pub fn translation_registers(&self) -> Result<TranslationRegisters> {
        match (self.ttbr1, self.cr3) {
            (Some(ttbr1), _) => Ok(TranslationRegisters::AArch64 {
                ttbr0: self.ttbr0.unwrap_or_default(),
                ttbr1,
            }),
            (None, Some(cr3)) => Ok(TranslationRegisters::X86_64 { cr3 }),
            (None, None) => Err(Error(ErrorOrigin::GroundTruth, ErrorKind::NotSupported)
                .log_error("query-kernel-info returned no translation registers")),
        }
    }
}

/// Parses an optional register given as integer or hex string.
fn register(value: &Value, name: &str) -> Result<Option<u64>> {
    match value.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_u64().map(Some).ok_or_else(|| {
            Error(ErrorOrigin::GroundTruth, ErrorKind::Protocol)
                .log_error(format!("{} is not an unsigned integer: {}", name, n))
        }),
        Some(Value::String(s)) => {
            let digits = s
                .trim()
                .trim_start_matches("0x")
                .trim_start_matches("0X")
                .replace('_', "");
            u64::from_str_radix(&digits, 16).map(Some).map_err(|_| {
                Error(ErrorOrigin::GroundTruth, ErrorKind::Protocol)
                    .log_error(format!("{} is not a hex value: {}", name, s))
            })
        }
        Some(other) => Err(Error(ErrorOrigin::GroundTruth, ErrorKind::Protocol)
            .log_error(format!("unexpected value for {}: {}", name, other))),
    }
}

/// A QMP session.
///
/// `S` is the transport, usually a [`TcpStream`]. Commands are executed synchronously.
pub struct QmpClient<S> {
    stream: BufReader<S>,
    version: String,
}

impl QmpClient<TcpStream> {
    /// Connects to a QMP server listening on TCP.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr).map_err(|err| {
            Error(ErrorOrigin::GroundTruth, ErrorKind::Connection).log_error(err)
        })?;
        stream
            .set_read_timeout(Some(DEFAULT_TIMEOUT))
            .map_err(|err| {
                Error(ErrorOrigin::GroundTruth, ErrorKind::Connection).log_error(err)
            })?;
        Self::new(stream)
    }

    /// Connects to the address given as default argument or as `addr`, e.g. `127.0.0.1:4444`.
    pub fn with_args(args: &ConnectorArgs) -> Result<Self> {
        let addr = args
            .get("addr")
            .or_else(|| args.get_default())
            .ok_or_else(|| {
                Error(ErrorOrigin::Args, ErrorKind::RequiredArgNotFound)
                    .log_error("a qmp address is required")
            })?;
        info!("connecting to qmp server at {}", addr);
        Self::connect(addr.as_str())
    }
}

impl<S: Read + Write> QmpClient<S> {
    /// Reads the greeting and negotiates capabilities on an established transport.
    pub fn new(stream: S) -> Result<Self> {
        let mut client = Self {
            stream: BufReader::new(stream),
            version: String::new(),
        };

        let greeting = client.read_message()?;
        let greeting: Greeting = serde_json::from_value(greeting).map_err(|err| {
            Error(ErrorOrigin::GroundTruth, ErrorKind::Protocol)
                .log_error(format!("unexpected qmp greeting: {}", err))
        })?;
        let qemu = &greeting.qmp.version.qemu;
        client.version = format!("{}.{}.{}", qemu.major, qemu.minor, qemu.micro);
        if !greeting.qmp.version.package.is_empty() {
            client.version = format!("{} ({})", client.version, greeting.qmp.version.package);
        }
        debug!(
            "qmp greeting from qemu {} (capabilities: {:?})",
            client.version, greeting.qmp.capabilities
        );

        client.execute("qmp_capabilities", None)?;
        info!("qmp session established with qemu {}", client.version);
        Ok(client)
    }

    /// Version string of the QEMU instance from its greeting.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Executes a command and returns the `return` member of its reply.
    pub fn execute(&mut self, command: &str, arguments: Option<Value>) -> Result<Value> {
        let request = match arguments {
            Some(arguments) => json!({ "execute": command, "arguments": arguments }),
            None => json!({ "execute": command }),
        };
        let mut line = request.to_string();
        trace!("qmp -> {}", line);
        line.push('\n');

        let stream = self.stream.get_mut();
        stream
            .write_all(line.as_bytes())
            .and_then(|_| stream.flush())
            .map_err(|err| {
                Error(ErrorOrigin::GroundTruth, ErrorKind::Connection).log_error(err)
            })?;

        self.read_reply(command)
    }

    /// Queries the translation registers and the current task of a cpu.
    pub fn kernel_info(&mut self, cpu_index: usize) -> Result<KernelInfo> {
        let ret = self.execute("query-kernel-info", Some(json!({ "cpu-index": cpu_index })))?;
        KernelInfo::from_value(&ret)
    }

    /// Translates a virtual address with the current register state of a cpu.
    ///
    /// Returns `None` if the address is not mapped.
    pub fn translate(
        &mut self,
        cpu_index: usize,
        va: VirtualAddress,
    ) -> Result<Option<PhysicalAddress>> {
        let ret = self.execute(
            "query-va2pa",
            Some(json!({ "cpu-index": cpu_index, "addr": va.as_u64() })),
        )?;
        if !ret.get("valid").and_then(Value::as_bool).unwrap_or(false) {
            return Ok(None);
        }
        Ok(register(&ret, "phys")?.map(PhysicalAddress::from))
    }

    /// Returns the run state of the virtual machine, e.g. `running` or `paused`.
    pub fn status(&mut self) -> Result<String> {
        let ret = self.execute("query-status", None)?;
        ret.get("status")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                Error(ErrorOrigin::GroundTruth, ErrorKind::Protocol)
                    .log_error("query-status reply without status")
            })
    }

    /// Consumes the session and returns the transport.
    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }

    fn read_message(&mut self) -> Result<Value> {
        let mut line = String::new();
        loop {
            line.clear();
            let read = self.stream.read_line(&mut line).map_err(|err| {
                Error(ErrorOrigin::GroundTruth, ErrorKind::Connection).log_error(err)
            })?;
            if read == 0 {
                return Err(Error(ErrorOrigin::GroundTruth, ErrorKind::Connection)
                    .log_error("qmp connection closed"));
            }
            if !line.trim().is_empty() {
                break;
            }
        }
        trace!("qmp <- {}", line.trim_end());

        serde_json::from_str(&line).map_err(|err| {
            Error(ErrorOrigin::GroundTruth, ErrorKind::Protocol)
                .log_error(format!("malformed qmp message: {}", err))
        })
    }

    fn read_reply(&mut self, command: &str) -> Result<Value> {
        for _ in 0..MAX_SKIPPED_EVENTS {
            let mut message = self.read_message()?;
            if let Some(event) = message.get("event") {
                debug!("skipping qmp event {}", event);
                continue;
            }
            if let Some(ret) = message.get_mut("return") {
                return Ok(ret.take());
            }
            if let Some(err) = message.get("error") {
                let msg = match serde_json::from_value::<QmpError>(err.clone()) {
                    Ok(err) => format!("{} failed: {} ({})", command, err.desc, err.class),
                    Err(_) => format!("{} failed: {}", command, err),
                };
                return Err(Error(ErrorOrigin::GroundTruth, ErrorKind::Protocol).log_error(msg));
            }
            return Err(Error(ErrorOrigin::GroundTruth, ErrorKind::Protocol)
                .log_error(format!("unexpected reply to {}: {}", command, message)));
        }
        Err(Error(ErrorOrigin::GroundTruth, ErrorKind::Protocol)
            .log_error(format!("no reply to {} after {} events", command, MAX_SKIPPED_EVENTS)))
    }
}

impl<S: Read + Write + Send> CpuState for QmpClient<S> {
    fn translation_registers(&mut self, cpu_index: usize) -> Result<TranslationRegisters> {
        self.kernel_info(cpu_index)?.translation_registers()
    }

    fn current_task(&mut self, cpu_index: usize) -> Result<Option<VirtualAddress>> {
        Ok(self.kernel_info(cpu_index)?.current_task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const GREETING: &str = r#"{"QMP": {"version": {"qemu": {"micro": 0, "minor": 2, "major": 8}, "package": "v8.2.0"}, "capabilities": ["oob"]}}"#;

    struct FakeStream {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl FakeStream {
        fn new(replies: &[&str]) -> Self {
            let mut input = String::new();
            input.push_str(GREETING);
            input.push('\n');
            input.push_str("{\"return\": {}}\n");
            for reply in replies.iter() {
                input.push_str(reply);
                input.push('\n');
            }
            Self {
                input: Cursor::new(input.into_bytes()),
                output: Vec::new(),
            }
        }

        fn requests(&self) -> Vec<Value> {
            String::from_utf8(self.output.clone())
                .unwrap()
                .lines()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect()
        }
    }

    impl Read for FakeStream {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for FakeStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_handshake() {
        let client = QmpClient::new(FakeStream::new(&[])).unwrap();
        assert_eq!(client.version(), "8.2.0 (v8.2.0)");
        let requests = client.into_inner().requests();
        assert_eq!(requests, vec![json!({"execute": "qmp_capabilities"})]);
    }

    #[test]
    fn test_aarch64_registers() {
        let stream = FakeStream::new(&[
            r#"{"event": "RESUME", "timestamp": {"seconds": 1, "microseconds": 2}}"#,
            r#"{"return": {"ttbr0": "0x4a8c1000", "ttbr1": "0x1000041d10000", "current-task": "0xffff00000a1e8000"}}"#,
            r#"{"return": {"ttbr0": 1251741696, "ttbr1": 1104216064, "current-task": null}}"#,
        ]);
        let mut client = QmpClient::new(stream).unwrap();

        let regs = client.translation_registers(1).unwrap();
        assert_eq!(
            regs,
            TranslationRegisters::AArch64 {
                ttbr0: 0x4a8c_1000,
                ttbr1: 0x1_0000_41d1_0000
            }
        );
        assert_eq!(regs.kernel_root(), PhysicalAddress::from(0x41d1_0000));
        assert_eq!(client.current_task(1).unwrap(), None);

        let requests = client.into_inner().requests();
        assert_eq!(
            requests[1],
            json!({"execute": "query-kernel-info", "arguments": {"cpu-index": 1}})
        );
    }

    #[test]
    fn test_x86_64_registers() {
        let stream = FakeStream::new(&[
            r#"{"return": {"cr3": "1a2b3000", "current-task": "0xffff888003a10000"}}"#,
        ]);
        let mut client = QmpClient::new(stream).unwrap();
        let info = client.kernel_info(0).unwrap();
        assert_eq!(
            info.translation_registers().unwrap(),
            TranslationRegisters::X86_64 { cr3: 0x1a2b_3000 }
        );
        assert_eq!(
            info.current_task,
            Some(VirtualAddress::from(0xffff_8880_03a1_0000))
        );
    }

    #[test]
    fn test_missing_registers() {
        let stream = FakeStream::new(&[r#"{"return": {}}"#]);
        let mut client = QmpClient::new(stream).unwrap();
        assert_eq!(
            client.translation_registers(0),
            Err(Error(ErrorOrigin::GroundTruth, ErrorKind::NotSupported))
        );
    }

    #[test]
    fn test_error_reply() {
        let stream = FakeStream::new(&[
            r#"{"error": {"class": "CommandNotFound", "desc": "The command query-kernel-info has not been found"}}"#,
        ]);
        let mut client = QmpClient::new(stream).unwrap();
        assert_eq!(
            client.kernel_info(0),
            Err(Error(ErrorOrigin::GroundTruth, ErrorKind::Protocol))
        );
    }

    #[test]
    fn test_translate() {
        let stream = FakeStream::new(&[
            r#"{"return": {"valid": true, "phys": 1107296256}}"#,
            r#"{"return": {"valid": false}}"#,
            r#"{"return": {"status": "paused", "running": false}}"#,
        ]);
        let mut client = QmpClient::new(stream).unwrap();
        let va = VirtualAddress::from(0xffff_0000_0000_0000);
        assert_eq!(
            client.translate(0, va).unwrap(),
            Some(PhysicalAddress::from(0x4200_0000))
        );
        assert_eq!(client.translate(0, va).unwrap(), None);
        assert_eq!(client.status().unwrap(), "paused");
    }

    #[test]
    fn test_connection_closed() {
        let stream = FakeStream::new(&[]);
        let mut client = QmpClient::new(stream).unwrap();
        assert_eq!(
            client.status(),
            Err(Error(ErrorOrigin::GroundTruth, ErrorKind::Connection))
        );
    }

    #[test]
    fn test_bad_greeting() {
        let stream = FakeStream {
            input: Cursor::new(b"{\"hello\": 1}\n".to_vec()),
            output: Vec::new(),
        };
        assert!(matches!(
            QmpClient::new(stream),
            Err(Error(ErrorOrigin::GroundTruth, ErrorKind::Protocol))
        ));
    }
}
