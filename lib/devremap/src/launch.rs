// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The hypervisor's launch parameters, as handed over by the instance
//! manager before the process is started.

use std::fs;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use devremap_config::DeviceConfigList;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;

/// Read/write access to the launch parameters.
pub trait LaunchConfig {
    fn command_line(&self) -> Vec<String>;

    fn set_command_line(&mut self, args: Vec<String>);

    fn configuration(&self) -> DeviceConfigList;

    /// Replaces the whole static configuration.
    fn set_configuration(&mut self, conf: DeviceConfigList);
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("I/O error on launch document {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed launch document {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Launch parameters kept in a JSON document.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchDocument {
    #[serde(default)]
    pub cmdline: Vec<String>,

    #[serde(default)]
    pub conf: DeviceConfigList,
}

impl LaunchDocument {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, LaunchError> {
        let path = path.as_ref();
        let io_err =
            |source| LaunchError::Io { path: path.to_path_buf(), source };
        let file = fs::File::open(path).map_err(io_err)?;
        serde_json::from_reader(BufReader::new(file)).map_err(|source| {
            LaunchError::Json { path: path.to_path_buf(), source }
        })
    }

    /// Writes the document to `path`, replacing it atomically.
    pub fn store<P: AsRef<Path>>(&self, path: P) -> Result<(), LaunchError> {
        let path = path.as_ref();
        let io_err =
            |source| LaunchError::Io { path: path.to_path_buf(), source };

        let raw = serde_json::to_vec_pretty(self).map_err(|source| {
            LaunchError::Json { path: path.to_path_buf(), source }
        })?;

        // Concurrent writers each get their own temporary file next to the
        // target, and the last rename wins.
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(&raw).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(path).map_err(|e| io_err(e.error))?;
        Ok(())
    }
}

impl LaunchConfig for LaunchDocument {
    fn command_line(&self) -> Vec<String> {
        self.cmdline.clone()
    }

    fn set_command_line(&mut self, args: Vec<String>) {
        self.cmdline = args;
    }

    fn configuration(&self) -> DeviceConfigList {
        self.conf.clone()
    }

    fn set_configuration(&mut self, conf: DeviceConfigList) {
        self.conf = conf;
    }
}
