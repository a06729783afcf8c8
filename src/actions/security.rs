use tracing::{debug, info};

use super::{Action, ActionCore};
use crate::kwp2000::{
    Link, Message, Request,
    constants::*,
    response::{is_positive_response_to, negative_response_to},
};
use crate::security::{KEY_ACCEPTED, SecuritySettings, is_unlocked_seed};

/// Seed/key login.
#[derive(Debug)]
pub struct SecurityAccess {
    core: ActionCore,
    settings: SecuritySettings,
}

impl SecurityAccess {
    pub fn new(settings: SecuritySettings) -> Self {
        Self {
            core: ActionCore::default(),
            settings,
        }
    }

    fn handle_seed(&mut self, link: &mut dyn Link, seed: &[u8]) {
        if is_unlocked_seed(seed) {
            info!("security access granted");
            self.core.complete(true);
            return;
        }
        match self.settings.key_request(seed) {
            Some(key) => {
                debug!("received security seed, sending key");
                self.core.send(link, Request::SecurityAccess(key));
            }
            None => {
                debug!(?seed, "seed has the wrong length");
                self.core.complete(false);
            }
        }
    }
}

impl Action for SecurityAccess {
    fn core(&self) -> &ActionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ActionCore {
        &mut self.core
    }

    fn name(&self) -> &'static str {
        "SecurityAccess"
    }

    fn start(&mut self, link: &mut dyn Link) {
        info!("requesting security access");
        self.core
            .send(link, Request::SecurityAccess(self.settings.seed_request()));
    }

    fn handle_message(&mut self, link: &mut dyn Link, message: &Message) -> bool {
        if is_positive_response_to(ServiceId::SecurityAccess, message) {
            match message.data.split_first() {
                Some((mode, seed)) if *mode == self.settings.request_seed_mode() => {
                    self.handle_seed(link, seed);
                }
                Some((mode, status)) if *mode == self.settings.send_key_mode() => {
                    let granted = status.first() == Some(&KEY_ACCEPTED);
                    if granted {
                        info!("security access granted");
                    } else {
                        info!("security access denied due to invalid key");
                    }
                    self.core.complete(granted);
                }
                _ => {
                    debug!("security response with unknown access mode");
                    self.core.complete(false);
                }
            }
            true
        } else if let Some(negative) = negative_response_to(ServiceId::SecurityAccess, message) {
            match negative.response_code() {
                Some(ResponseCode::InvalidKey) => info!("security access denied due to invalid key"),
                Some(ResponseCode::ServiceNotSupported) => {
                    info!("ECU reports security access is not supported")
                }
                Some(ResponseCode::GeneralReject) => info!("security access request was rejected"),
                Some(ResponseCode::RequiredTimeDelayNotExpired) => {
                    info!("security access is locked out until the lockout time has elapsed")
                }
                _ => info!("security access denied, {negative}"),
            }
            self.core.complete(false);
            true
        } else {
            false
        }
    }
}
