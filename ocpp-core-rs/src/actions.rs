//! Well-known OCPP action names
//!
//! The core routes on plain strings; these constants exist so handler
//! registrations and filters do not scatter string literals.

// CS -> CSMS
pub const BOOT_NOTIFICATION: &str = "BootNotification";
pub const HEARTBEAT: &str = "Heartbeat";
pub const STATUS_NOTIFICATION: &str = "StatusNotification";
pub const METER_VALUES: &str = "MeterValues";
pub const TRANSACTION_EVENT: &str = "TransactionEvent";
pub const AUTHORIZE: &str = "Authorize";
pub const NOTIFY_REPORT: &str = "NotifyReport";
pub const SECURITY_EVENT_NOTIFICATION: &str = "SecurityEventNotification";

// CSMS -> CS
pub const RESET: &str = "Reset";
pub const GET_FILE: &str = "GetFile";
pub const SEND_FILE: &str = "SendFile";
pub const SEND_LOCAL_LIST: &str = "SendLocalList";
pub const SET_CHARGING_PROFILE: &str = "SetChargingProfile";
pub const REQUEST_START_TRANSACTION: &str = "RequestStartTransaction";
pub const REQUEST_STOP_TRANSACTION: &str = "RequestStopTransaction";
pub const RESERVE_NOW: &str = "ReserveNow";
pub const CANCEL_RESERVATION: &str = "CancelReservation";
pub const GET_VARIABLES: &str = "GetVariables";
pub const SET_VARIABLES: &str = "SetVariables";
pub const UPDATE_FIRMWARE: &str = "UpdateFirmware";

// Bidirectional
pub const DATA_TRANSFER: &str = "DataTransfer";
pub const BINARY_DATA_TRANSFER: &str = "BinaryDataTransfer";

/// OCPP WebSocket subprotocol identifiers
pub mod subprotocols {
    pub const OCPP16: &str = "ocpp1.6";
    pub const OCPP201: &str = "ocpp2.0.1";
    pub const OCPP21: &str = "ocpp2.1";
}
