// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use serde_json::{json, Value};
use slog::{debug, trace, Logger};

use super::{
    BlockInfo, BlockdevOptions, DeviceAdd, Monitor, MonitorError,
    ObjectPropertyInfo,
};

/// A synchronous QMP session.
///
/// Requests are issued one at a time; each call writes a single command and
/// reads until its response arrives, discarding any asynchronous events
/// that are interleaved with it.
pub struct QmpClient<S: Read + Write> {
    stream: BufReader<S>,
    next_id: u64,
    log: Logger,
}

impl QmpClient<UnixStream> {
    /// Connects to the monitor socket at `path` and negotiates capabilities.
    pub fn connect<P: AsRef<Path>>(
        path: P,
        timeout: Option<Duration>,
        log: Logger,
    ) -> Result<Self, MonitorError> {
        let sock = UnixStream::connect(path.as_ref())?;
        sock.set_read_timeout(timeout)?;
        sock.set_write_timeout(timeout)?;
        Self::handshake(sock, log)
    }
}

impl<S: Read + Write> QmpClient<S> {
    /// Takes over a freshly opened monitor stream: consumes the greeting and
    /// leaves capabilities negotiation mode.
    pub fn handshake(stream: S, log: Logger) -> Result<Self, MonitorError> {
        let mut client = Self { stream: BufReader::new(stream), next_id: 0, log };

        let greeting = client.read_message()?;
        let Some(qmp) = greeting.get("QMP") else {
            return Err(MonitorError::Greeting(greeting.to_string()));
        };
        debug!(client.log, "connected to monitor";
            "version" => %qmp.get("version").unwrap_or(&Value::Null));

        client.execute("qmp_capabilities", None)?;
        Ok(client)
    }

    fn read_message(&mut self) -> Result<Value, MonitorError> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.stream.read_line(&mut line)? == 0 {
                return Err(MonitorError::Closed);
            }
            let msg = line.trim();
            if !msg.is_empty() {
                return Ok(serde_json::from_str(msg)?);
            }
        }
    }

    /// Runs `command`, returning the contents of its `return` member.
    pub fn execute(
        &mut self,
        command: &str,
        arguments: Option<Value>,
    ) -> Result<Value, MonitorError> {
        self.next_id += 1;
        let id = json!(self.next_id);

        let mut request = json!({ "execute": command, "id": id });
        if let Some(args) = arguments {
            request["arguments"] = args;
        }
        trace!(self.log, "monitor request"; "request" => %request);

        let mut raw = serde_json::to_vec(&request)?;
        raw.push(b'\n');
        let writer = self.stream.get_mut();
        writer.write_all(&raw)?;
        writer.flush()?;

        loop {
            let mut msg = self.read_message()?;
            if let Some(event) = msg.get("event") {
                debug!(self.log, "skipping monitor event"; "event" => %event);
                continue;
            }
            if msg.get("id").is_some_and(|resp| resp != &id) {
                return Err(MonitorError::UnexpectedResponse {
                    command: command.to_string(),
                    response: msg.to_string(),
                });
            }
            if let Some(ret) = msg.get_mut("return") {
                return Ok(ret.take());
            }
            if let Some(err) = msg.get("error") {
                let field = |name: &str| {
                    err.get(name)
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string()
                };
                return Err(MonitorError::Command {
                    command: command.to_string(),
                    class: field("class"),
                    desc: field("desc"),
                });
            }
            return Err(MonitorError::UnexpectedResponse {
                command: command.to_string(),
                response: msg.to_string(),
            });
        }
    }

    fn execute_unit(
        &mut self,
        command: &str,
        arguments: Value,
    ) -> Result<(), MonitorError> {
        self.execute(command, Some(arguments)).map(|_| ())
    }
}

impl<S: Read + Write> Monitor for QmpClient<S> {
    fn query_block(&mut self) -> Result<Vec<BlockInfo>, MonitorError> {
        let ret = self.execute("query-block", None)?;
        Ok(serde_json::from_value(ret)?)
    }

    fn qom_list(
        &mut self,
        path: &str,
    ) -> Result<Vec<ObjectPropertyInfo>, MonitorError> {
        let ret = self.execute("qom-list", Some(json!({ "path": path })))?;
        Ok(serde_json::from_value(ret)?)
    }

    fn qom_get(
        &mut self,
        path: &str,
        property: &str,
    ) -> Result<Value, MonitorError> {
        self.execute(
            "qom-get",
            Some(json!({ "path": path, "property": property })),
        )
    }

    fn qom_set(
        &mut self,
        path: &str,
        property: &str,
        value: Value,
    ) -> Result<(), MonitorError> {
        self.execute_unit(
            "qom-set",
            json!({ "path": path, "property": property, "value": value }),
        )
    }

    fn blockdev_add(
        &mut self,
        opts: &BlockdevOptions,
    ) -> Result<(), MonitorError> {
        self.execute_unit("blockdev-add", serde_json::to_value(opts)?)
    }

    fn netdev_add(
        &mut self,
        id: &str,
        fds: &[String],
    ) -> Result<(), MonitorError> {
        self.execute_unit(
            "netdev_add",
            json!({ "type": "tap", "id": id, "fds": fds.join(":") }),
        )
    }

    fn device_add(&mut self, dev: &DeviceAdd) -> Result<(), MonitorError> {
        self.execute_unit("device_add", serde_json::to_value(dev)?)
    }

    fn device_del(&mut self, id: &str) -> Result<(), MonitorError> {
        self.execute_unit("device_del", json!({ "id": id }))
    }

    fn set_link(&mut self, name: &str, up: bool) -> Result<(), MonitorError> {
        self.execute_unit("set_link", json!({ "name": name, "up": up }))
    }

    fn human_monitor_command(
        &mut self,
        command_line: &str,
    ) -> Result<String, MonitorError> {
        let ret = self.execute(
            "human-monitor-command",
            Some(json!({ "command-line": command_line })),
        )?;
        match ret {
            Value::String(text) => Ok(text.replace("\r\n", "\n")),
            other => Err(MonitorError::UnexpectedResponse {
                command: "human-monitor-command".to_string(),
                response: other.to_string(),
            }),
        }
    }
}
