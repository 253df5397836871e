pub mod automator;
pub mod captcha;
pub mod challenge;
pub mod code_channel;
