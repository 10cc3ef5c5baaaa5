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

//! BlueZ adapter via bluer.

use anyhow::Result;
use async_trait::async_trait;
use bluer::rfcomm::{Profile, ProfileHandle, ReqError, Role};
use bluer::{Adapter, Address, Session};
use futures::StreamExt;
use std::io;
use std::pin::Pin;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::platform::{
    BtPlatform, PeerSocket, RemoteDevice, RfcommAcceptor, SecurityMode, ServiceRecord,
};

fn to_io(e: bluer::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

fn parse_addr(addr: &str) -> io::Result<Address> {
    addr.parse::<Address>()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// RFCOMM profile for `service`. BlueZ publishes the SDP record of a
/// server profile; a client profile only receives outbound connections.
fn profile_for(service: &ServiceRecord, mode: SecurityMode, role: Role) -> Profile {
    let channel = match role {
        Role::Server => Some(u16::from(service.channel_for(mode))),
        Role::Client => None,
    };
    Profile {
        uuid: service.uuid,
        name: Some(format!("{} ({})", service.name, mode.as_str())),
        role: Some(role),
        channel,
        require_authentication: Some(mode == SecurityMode::Secure),
        require_authorization: Some(false),
        auto_connect: Some(false),
        ..Default::default()
    }
}

/// The default BlueZ adapter.
pub struct BluezPlatform {
    session: Session,
    adapter: Adapter,
    alias: String,
    address: String,
    // one outbound profile registration per UUID at a time
    dial: Mutex<()>,
}

impl BluezPlatform {
    /// Open the default adapter and power it on if needed.
    pub async fn new(alias: Option<&str>) -> Result<Self> {
        let session = Session::new().await?;
        info!("BlueZ session created");

        let adapter = session.default_adapter().await?;
        info!("Using Bluetooth adapter: {}", adapter.name());

        if !adapter.is_powered().await? {
            info!("Powering on Bluetooth adapter...");
            adapter.set_powered(true).await?;
        }

        if let Some(alias) = alias {
            adapter.set_alias(alias.to_string()).await?;
            info!("Bluetooth name set to: {}", alias);
        }
        let alias = adapter.alias().await?;
        let address = adapter.address().await?.to_string();

        Ok(Self {
            session,
            adapter,
            alias,
            address,
            dial: Mutex::new(()),
        })
    }

    async fn describe(&self, addr: Address) -> io::Result<RemoteDevice> {
        let device = self.adapter.device(addr).map_err(to_io)?;
        let name = device.alias().await.ok().or(device.name().await.ok().flatten());
        Ok(RemoteDevice {
            name,
            address: addr.to_string(),
            class: device.class().await.ok().flatten(),
        })
    }
}

/// Connections BlueZ hands to a registered server profile. Dropping it
/// unregisters the profile and its SDP record.
struct BluezAcceptor {
    profile: Pin<Box<ProfileHandle>>,
    adapter: Adapter,
}

#[async_trait]
impl RfcommAcceptor for BluezAcceptor {
    async fn accept(&mut self) -> io::Result<PeerSocket> {
        let request = self
            .profile
            .next()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "profile unregistered"))?;
        let addr = request.device();
        let stream = request.accept().map_err(to_io)?;
        let name = match self.adapter.device(addr) {
            Ok(device) => device.alias().await.ok(),
            Err(_) => None,
        };
        let device = RemoteDevice {
            name,
            address: addr.to_string(),
            class: None,
        };
        Ok(PeerSocket::new(stream, device))
    }
}

#[async_trait]
impl BtPlatform for BluezPlatform {
    fn is_available(&self) -> bool {
        true
    }

    async fn is_enabled(&self) -> bool {
        self.adapter.is_powered().await.unwrap_or(false)
    }

    fn has_permissions(&self) -> bool {
        true
    }

    async fn bonded_devices(&self) -> io::Result<Vec<RemoteDevice>> {
        let mut devices = Vec::new();
        for addr in self.adapter.device_addresses().await.map_err(to_io)? {
            let device = self.adapter.device(addr).map_err(to_io)?;
            if device.is_paired().await.unwrap_or(false) {
                devices.push(self.describe(addr).await?);
            }
        }
        debug!("{} bonded devices", devices.len());
        Ok(devices)
    }

    async fn remote_device(&self, address: &str) -> io::Result<Option<RemoteDevice>> {
        let addr = parse_addr(address)?;
        let known = self.adapter.device_addresses().await.map_err(to_io)?;
        if !known.contains(&addr) {
            return Ok(None);
        }
        self.describe(addr).await.map(Some)
    }

    async fn connect(
        &self,
        device: &RemoteDevice,
        mode: SecurityMode,
        service: &ServiceRecord,
    ) -> io::Result<PeerSocket> {
        let addr = parse_addr(&device.address)?;
        let remote = self.adapter.device(addr).map_err(to_io)?;

        let _dialing = self.dial.lock().await;
        let mut profile = Box::pin(
            self.session
                .register_profile(profile_for(service, mode, Role::Client))
                .await
                .map_err(to_io)?,
        );

        // BlueZ resolves the UUID over SDP and hands the socket to our
        // client profile before ConnectProfile returns
        let connecting = remote.connect_profile(&service.uuid);
        tokio::pin!(connecting);
        let mut connected = false;
        loop {
            tokio::select! {
                result = &mut connecting, if !connected => {
                    result.map_err(to_io)?;
                    connected = true;
                }
                request = profile.next() => {
                    let Some(request) = request else {
                        return Err(io::Error::new(
                            io::ErrorKind::BrokenPipe,
                            "profile unregistered",
                        ));
                    };
                    if request.device() != addr {
                        warn!("Rejecting {} on outbound profile", request.device());
                        request.reject(ReqError::Rejected);
                        continue;
                    }
                    let stream = request.accept().map_err(to_io)?;
                    return Ok(PeerSocket::new(stream, device.clone()));
                }
            }
        }
    }

    async fn listen(
        &self,
        mode: SecurityMode,
        service: &ServiceRecord,
    ) -> io::Result<Box<dyn RfcommAcceptor>> {
        let profile = self
            .session
            .register_profile(profile_for(service, mode, Role::Server))
            .await
            .map_err(to_io)?;
        debug!(
            "Registered {} ({}) as {} on channel {}",
            service.name,
            mode.as_str(),
            service.uuid,
            service.channel_for(mode)
        );
        Ok(Box::new(BluezAcceptor {
            profile: Box::pin(profile),
            adapter: self.adapter.clone(),
        }))
    }

    fn adapter_name(&self) -> Option<String> {
        Some(self.alias.clone())
    }

    fn adapter_address(&self) -> Option<String> {
        Some(self.address.clone())
    }
}
