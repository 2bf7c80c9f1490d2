use std::fmt;

/// States of the customer and service UI.
///
/// ```text
/// Boot ─► FrontBegin ─► FrontSelect ⇄ FrontTune
///  │          ▲             │
///  ▼          │             ├─► FrontAccept ─► FrontEnd ─┐
/// Broken      └─────────────┴─► FrontTimeout ─► FrontEnd ┘
///
/// any ─(service key)─► ServiceBegin ─► ServiceAuth ─► ServiceMenu
///     ServiceMenu ─► Inventory | Test | Reboot | Network | MoneyLoad | Report
///     ServiceEnd ─► FrontBegin
/// any ─(lock)─► Locked ─► previous target
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum UiState {
    #[default]
    Invalid,
    Boot,
    Broken,
    Locked,

    FrontBegin,
    FrontSelect,
    FrontTune,
    FrontAccept,
    FrontTimeout,
    FrontEnd,

    ServiceBegin,
    ServiceAuth,
    ServiceMenu,
    ServiceInventory,
    ServiceTest,
    ServiceReboot,
    ServiceNetwork,
    ServiceMoneyLoad,
    ServiceReport,
    ServiceEnd,

    Stop,
}

impl UiState {
    pub fn is_service(self) -> bool {
        matches!(
            self,
            Self::ServiceBegin
                | Self::ServiceAuth
                | Self::ServiceMenu
                | Self::ServiceInventory
                | Self::ServiceTest
                | Self::ServiceReboot
                | Self::ServiceNetwork
                | Self::ServiceMoneyLoad
                | Self::ServiceReport
                | Self::ServiceEnd
        )
    }

    /// A customer may be mid-interaction: between showing the menu and
    /// finishing a sale.
    pub fn is_customer(self) -> bool {
        matches!(
            self,
            Self::FrontSelect
                | Self::FrontTune
                | Self::FrontAccept
                | Self::FrontTimeout
        )
    }
}

impl fmt::Display for UiState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Invalid => "Invalid",
            Self::Boot => "Boot",
            Self::Broken => "Broken",
            Self::Locked => "Locked",
            Self::FrontBegin => "FrontBegin",
            Self::FrontSelect => "FrontSelect",
            Self::FrontTune => "FrontTune",
            Self::FrontAccept => "FrontAccept",
            Self::FrontTimeout => "FrontTimeout",
            Self::FrontEnd => "FrontEnd",
            Self::ServiceBegin => "ServiceBegin",
            Self::ServiceAuth => "ServiceAuth",
            Self::ServiceMenu => "ServiceMenu",
            Self::ServiceInventory => "ServiceInventory",
            Self::ServiceTest => "ServiceTest",
            Self::ServiceReboot => "ServiceReboot",
            Self::ServiceNetwork => "ServiceNetwork",
            Self::ServiceMoneyLoad => "ServiceMoneyLoad",
            Self::ServiceReport => "ServiceReport",
            Self::ServiceEnd => "ServiceEnd",
            Self::Stop => "Stop",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_groups() {
        assert!(UiState::ServiceMoneyLoad.is_service());
        assert!(!UiState::FrontBegin.is_service());
        assert!(UiState::FrontTune.is_customer());
        assert!(!UiState::FrontBegin.is_customer());
        assert_eq!(UiState::FrontAccept.to_string(), "FrontAccept");
    }
}
