// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Watchdog descriptors: `i6300esb,action=reset`.

use super::{push_field, Fields, ParseError};

#[derive(
    Clone, Copy, PartialEq, Eq, Debug, Default, strum::EnumString,
    strum::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum WatchdogModel {
    #[default]
    I6300esb,
    Ib700,
}

/// What the hypervisor does when the guest stops feeding the watchdog.
#[derive(
    Clone, Copy, PartialEq, Eq, Debug, strum::EnumString, strum::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum WatchdogAction {
    Reset,
    Shutdown,
    Poweroff,
    Pause,
    Debug,
    None,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct WatchdogSpec {
    pub model: WatchdogModel,
    pub action: Option<WatchdogAction>,
}

impl WatchdogSpec {
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let mut f = Fields::split(raw)?;
        let model = match f.positional() {
            Some(m) => m.parse().map_err(|_| ParseError::Value {
                field: "model",
                value: m,
            })?,
            None => f.take("model")?.unwrap_or_default(),
        };
        let spec = WatchdogSpec { model, action: f.take("action")? };
        f.finish()?;
        Ok(spec)
    }

    pub fn print(&self) -> String {
        let mut out = self.model.to_string();
        if let Some(action) = self.action {
            push_field(&mut out, "action", action);
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_and_print() {
        let spec = WatchdogSpec::parse("i6300esb,action=reset").unwrap();
        assert_eq!(spec.model, WatchdogModel::I6300esb);
        assert_eq!(spec.action, Some(WatchdogAction::Reset));
        assert_eq!(spec.print(), "i6300esb,action=reset");

        let bare = WatchdogSpec::parse("action=poweroff").unwrap();
        assert_eq!(bare.model, WatchdogModel::I6300esb);

        assert!(WatchdogSpec::parse("i6300esb,action=explode").is_err());
        assert!(WatchdogSpec::parse("rolex").is_err());
    }
}
