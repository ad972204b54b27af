//! FTPS file access for Bambu printers.
//!
//! The printer exposes its storage over implicit TLS on port 990 with the
//! same `bblp` user as the MQTT broker. Sessions are short-lived: each
//! operation opens its own connection on the blocking pool, so file access
//! never depends on the state of the MQTT channel.

use crate::adapter::{AdapterError, AdapterResult, FileEntry};
use crate::transport::{bambu_host, BAMBU_USER};
use bytes::Bytes;
use printfleet_core::LoginDto;
use std::io::Cursor;
use std::time::{Duration, UNIX_EPOCH};
use suppaftp::list::File as ListEntry;
use suppaftp::native_tls::TlsConnector;
use suppaftp::types::FileType;
use suppaftp::{FtpError, NativeTlsConnector, NativeTlsFtpStream, Status};
use tracing::{debug, warn};

/// Implicit FTPS port.
pub const BAMBU_FTP_PORT: u16 = 990;

/// Socket read/write timeout for one FTP session.
const IO_TIMEOUT: Duration = Duration::from_secs(30);

fn ftp_error(context: &str, err: FtpError) -> AdapterError {
    match &err {
        // 550: no such file or directory
        FtpError::UnexpectedResponse(response) if response.status == Status::FileUnavailable => {
            AdapterError::Protocol(format!("FTP {}: file unavailable", context))
        }
        _ => AdapterError::Connection(format!("FTP {} failed: {}", context, err)),
    }
}

/// Open a logged-in session. A failed login closes the control connection
/// before the error is returned.
fn open(host: &str, access_code: &str) -> AdapterResult<NativeTlsFtpStream> {
    let tls = TlsConnector::builder()
        // The printer presents a self-signed certificate
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .map_err(|e| AdapterError::Connection(format!("TLS setup failed: {}", e)))?;

    let mut ftp = NativeTlsFtpStream::connect_secure_implicit(
        (host, BAMBU_FTP_PORT),
        NativeTlsConnector::from(tls),
        host,
    )
    .map_err(|e| ftp_error("connect", e))?;

    if let Err(e) = ftp.get_ref().set_read_timeout(Some(IO_TIMEOUT)) {
        debug!("Could not set FTP read timeout: {}", e);
    }
    if let Err(e) = ftp.get_ref().set_write_timeout(Some(IO_TIMEOUT)) {
        debug!("Could not set FTP write timeout: {}", e);
    }

    if let Err(e) = ftp.login(BAMBU_USER, access_code) {
        if let Err(quit) = ftp.quit() {
            debug!("FTP quit after failed login: {}", quit);
        }
        return Err(ftp_error("login", e));
    }
    ftp.transfer_type(FileType::Binary)
        .map_err(|e| ftp_error("TYPE I", e))?;
    Ok(ftp)
}

fn absolute(path: &str) -> String {
    format!("/{}", path.trim_matches('/'))
}

fn entry_from_listing(folder: &str, item: &ListEntry) -> FileEntry {
    let path = if folder.is_empty() {
        item.name().to_string()
    } else {
        format!("{}/{}", folder, item.name())
    };
    FileEntry {
        path,
        size: Some(item.size() as u64),
        date: item
            .modified()
            .duration_since(UNIX_EPOCH)
            .ok()
            .map(|d| d.as_secs() as i64),
    }
}

/// FTPS client for one printer, keyed by host and access code.
#[derive(Debug, Clone)]
pub struct BambuFtp {
    host: String,
    access_code: String,
}

impl BambuFtp {
    pub fn new(host: impl Into<String>, access_code: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            access_code: access_code.into(),
        }
    }

    pub fn from_login(login: &LoginDto) -> AdapterResult<Self> {
        let access_code = login
            .access_code
            .clone()
            .ok_or_else(|| AdapterError::Configuration("access code is required".into()))?;
        Ok(Self::new(bambu_host(&login.printer_url), access_code))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Run `op` on a fresh session in the blocking pool.
    async fn run<T, F>(&self, context: &'static str, op: F) -> AdapterResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut NativeTlsFtpStream) -> Result<T, FtpError> + Send + 'static,
    {
        let host = self.host.clone();
        let access_code = self.access_code.clone();
        tokio::task::spawn_blocking(move || {
            let mut ftp = open(&host, &access_code)?;
            let result = op(&mut ftp);
            if let Err(e) = ftp.quit() {
                warn!(host = %host, "FTP quit failed: {}", e);
            }
            result.map_err(|e| ftp_error(context, e))
        })
        .await
        .map_err(|e| AdapterError::Other(anyhow::anyhow!("FTP task failed: {}", e)))?
    }

    /// Every file on the storage, folders walked recursively.
    pub async fn list(&self) -> AdapterResult<Vec<FileEntry>> {
        self.run("LIST", |ftp| {
            let mut files = Vec::new();
            let mut folders = vec![String::new()];
            while let Some(folder) = folders.pop() {
                let lines = ftp.list(Some(&absolute(&folder)))?;
                for line in lines {
                    let Ok(item) = ListEntry::try_from(line.as_str()) else {
                        continue;
                    };
                    if matches!(item.name(), "." | "..") {
                        continue;
                    }
                    if item.is_directory() {
                        folders.push(if folder.is_empty() {
                            item.name().to_string()
                        } else {
                            format!("{}/{}", folder, item.name())
                        });
                    } else {
                        files.push(entry_from_listing(&folder, &item));
                    }
                }
            }
            Ok(files)
        })
        .await
    }

    pub async fn stat(&self, path: &str) -> AdapterResult<FileEntry> {
        let remote = absolute(path);
        let entry_path = path.trim_matches('/').to_string();
        self.run("SIZE", move |ftp| {
            let size = ftp.size(&remote)?;
            let date = ftp
                .mdtm(&remote)
                .ok()
                .map(|modified| modified.and_utc().timestamp());
            Ok(FileEntry {
                path: entry_path,
                size: Some(size as u64),
                date,
            })
        })
        .await
    }

    pub async fn upload(&self, path: &str, data: Bytes) -> AdapterResult<()> {
        let remote = absolute(path);
        self.run("STOR", move |ftp| {
            let mut reader = Cursor::new(data);
            ftp.put_file(&remote, &mut reader)?;
            Ok(())
        })
        .await
    }

    pub async fn download(&self, path: &str) -> AdapterResult<Bytes> {
        let remote = absolute(path);
        self.run("RETR", move |ftp| {
            let buffer = ftp.retr_as_buffer(&remote)?;
            Ok(Bytes::from(buffer.into_inner()))
        })
        .await
    }

    pub async fn delete(&self, path: &str) -> AdapterResult<()> {
        let remote = absolute(path);
        self.run("DELE", move |ftp| ftp.rm(&remote)).await
    }

    pub async fn mkdir(&self, path: &str) -> AdapterResult<()> {
        let remote = absolute(path);
        self.run("MKD", move |ftp| ftp.mkdir(&remote)).await
    }

    pub async fn rmdir(&self, path: &str) -> AdapterResult<()> {
        let remote = absolute(path);
        self.run("RMD", move |ftp| ftp.rmdir(&remote)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use printfleet_core::PrinterProtocol;

    #[test]
    fn test_from_login_uses_host_and_code() {
        let login = LoginDto::new(PrinterProtocol::Bambu, "mqtts://192.168.1.40:8883")
            .with_device_secret("01S00A000000000", "12345678");
        let ftp = BambuFtp::from_login(&login).unwrap();
        assert_eq!(ftp.host(), "192.168.1.40");
    }

    #[test]
    fn test_absolute_paths() {
        assert_eq!(absolute("cache/benchy.3mf"), "/cache/benchy.3mf");
        assert_eq!(absolute("/"), "/");
    }

    #[test]
    fn test_entry_from_listing() {
        let item = ListEntry::try_from(
            "-rw-rw-rw- 1 user group 1024 Nov 05 12:00 benchy.3mf",
        )
        .unwrap();
        let entry = entry_from_listing("cache", &item);
        assert_eq!(entry.path, "cache/benchy.3mf");
        assert_eq!(entry.size, Some(1024));
    }

    #[tokio::test]
    async fn test_unreachable_host_fails() {
        // Nothing listens on the local FTPS port
        let ftp = BambuFtp::new("127.0.0.1", "0000");
        let err = ftp.delete("a.gcode").await.unwrap_err();
        assert!(matches!(err, AdapterError::Connection(_)));
    }
}
