//! Fixed device and application metadata sent with every CONNECT
//!
//! The defaults describe the Android application build the server expects.
//! Every field can be overridden from the `[client]` config section.

use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_AGENT: &str = "[FBAN/MQTT;FBAV/64.0.0.14.96;FBBV/125398467;FBDM/{density=4.0,width=1440,height=2392};FBLC/en_US;FBCR/;FBMF/LGE;FBBD/lge;FBPN/com.instagram.android;FBDV/RS988;FBSV/6.0.1;FBLR/0;FBBK/1;FBCA/armeabi-v7a:armeabi;]";
pub const DEFAULT_PACKAGE_NAME: &str = "com.instagram.android";
pub const DEFAULT_ANALYTICS_APP_ID: &str = "567067343352427";
pub const DEFAULT_APP_ID: i64 = 567310203415052;
pub const DEFAULT_CLIENT_TYPE: &str = "device_auth";

/// Client metadata embedded in the auth payload and the registration request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientProfile {
    pub user_agent: String,
    pub client_capabilities: i64,
    pub endpoint_capabilities: i64,
    pub publish_format: i32,
    pub no_automatic_foreground: bool,
    pub make_user_available_in_foreground: bool,
    pub is_initially_foreground: bool,
    pub network_type: i32,
    pub network_subtype: i32,
    pub client_type: String,
    pub app_id: i64,
    pub client_stack: i8,
    /// Package name sent in the registration request
    pub package_name: String,
    /// Analytics application id sent in the registration request
    pub analytics_app_id: String,
}

impl Default for ClientProfile {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            client_capabilities: 439,
            endpoint_capabilities: 128,
            publish_format: 1,
            no_automatic_foreground: true,
            make_user_available_in_foreground: false,
            is_initially_foreground: false,
            network_type: 1,
            network_subtype: 0,
            client_type: DEFAULT_CLIENT_TYPE.to_string(),
            app_id: DEFAULT_APP_ID,
            client_stack: 3,
            package_name: DEFAULT_PACKAGE_NAME.to_string(),
            analytics_app_id: DEFAULT_ANALYTICS_APP_ID.to_string(),
        }
    }
}
