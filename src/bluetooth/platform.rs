// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Adapter abstraction: device enumeration, RFCOMM connect and listen.

use async_trait::async_trait;
use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

/// Address some stacks report instead of the real one.
pub const BOGUS_ADDR: &str = "02:00:00:00:00:00";

/// Whether an address is the placeholder that can't be dialed.
pub fn is_bogus_addr(addr: &str) -> bool {
    addr == BOGUS_ADDR
}

/// Major device class from a Bluetooth class-of-device value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MajorClass {
    Misc,
    Computer,
    Phone,
    Networking,
    AudioVideo,
    Peripheral,
    Imaging,
    Wearable,
    Toy,
    Health,
    Uncategorized,
}

impl MajorClass {
    /// Extract the major class bits (8..13) of a class-of-device.
    pub fn from_class_of_device(cod: u32) -> Self {
        match (cod >> 8) & 0x1f {
            0x00 => Self::Misc,
            0x01 => Self::Computer,
            0x02 => Self::Phone,
            0x03 => Self::Networking,
            0x04 => Self::AudioVideo,
            0x05 => Self::Peripheral,
            0x06 => Self::Imaging,
            0x07 => Self::Wearable,
            0x08 => Self::Toy,
            0x09 => Self::Health,
            _ => Self::Uncategorized,
        }
    }

    /// Classes that never run the game.
    pub fn is_excluded(self) -> bool {
        matches!(
            self,
            Self::AudioVideo | Self::Health | Self::Imaging | Self::Toy | Self::Peripheral
        )
    }
}

/// A remote Bluetooth device as seen by the adapter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteDevice {
    pub name: Option<String>,
    pub address: String,
    pub class: Option<u32>,
}

impl RemoteDevice {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            address: address.into(),
            class: None,
        }
    }

    pub fn with_class(mut self, class: u32) -> Self {
        self.class = Some(class);
        self
    }

    /// Name if known, otherwise the address.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }

    pub fn major_class(&self) -> Option<MajorClass> {
        self.class.map(MajorClass::from_class_of_device)
    }

    /// Whether this bonded device may be a game peer. Devices that don't
    /// report a class are kept.
    pub fn is_candidate(&self) -> bool {
        !self.major_class().map_or(false, MajorClass::is_excluded)
    }
}

impl fmt::Display for RemoteDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.display_name(), self.address)
    }
}

/// RFCOMM channel security.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityMode {
    Secure,
    Insecure,
}

impl SecurityMode {
    /// Connect attempts alternate, starting with insecure.
    pub fn for_attempt(attempt: u32) -> Self {
        if attempt % 2 == 0 {
            Self::Insecure
        } else {
            Self::Secure
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Secure => "secure",
            Self::Insecure => "insecure",
        }
    }
}

/// The application's fixed service record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub name: String,
    pub uuid: Uuid,
    /// RFCOMM channel of the secure variant; the insecure one uses the next.
    pub channel: u8,
}

impl ServiceRecord {
    pub fn channel_for(&self, mode: SecurityMode) -> u8 {
        match mode {
            SecurityMode::Secure => self.channel,
            SecurityMode::Insecure => self.channel.wrapping_add(1),
        }
    }
}

/// Byte stream of a connected RFCOMM socket.
pub trait PeerStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> PeerStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// A connected socket together with the device on the other end.
pub struct PeerSocket {
    pub stream: Box<dyn PeerStream>,
    pub remote: RemoteDevice,
}

impl PeerSocket {
    pub fn new(stream: impl PeerStream + 'static, remote: RemoteDevice) -> Self {
        Self {
            stream: Box::new(stream),
            remote,
        }
    }
}

impl fmt::Debug for PeerSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSocket")
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

/// An open server channel. Dropping it closes the channel.
#[async_trait]
pub trait RfcommAcceptor: Send {
    async fn accept(&mut self) -> io::Result<PeerSocket>;
}

/// Adapter and permission provider.
#[async_trait]
pub trait BtPlatform: Send + Sync + 'static {
    /// Whether an adapter exists at all.
    fn is_available(&self) -> bool;

    /// Whether the adapter is powered.
    async fn is_enabled(&self) -> bool;

    /// Whether this process may use Bluetooth.
    fn has_permissions(&self) -> bool;

    /// Paired devices.
    async fn bonded_devices(&self) -> io::Result<Vec<RemoteDevice>>;

    /// Look up a device by address; `None` if the adapter doesn't know it.
    async fn remote_device(&self, address: &str) -> io::Result<Option<RemoteDevice>>;

    async fn connect(
        &self,
        device: &RemoteDevice,
        mode: SecurityMode,
        service: &ServiceRecord,
    ) -> io::Result<PeerSocket>;

    async fn listen(
        &self,
        mode: SecurityMode,
        service: &ServiceRecord,
    ) -> io::Result<Box<dyn RfcommAcceptor>>;

    /// Local adapter name, if known.
    fn adapter_name(&self) -> Option<String>;

    /// Local adapter address. Stacks that hide it return `None`.
    fn adapter_address(&self) -> Option<String> {
        None
    }
}
