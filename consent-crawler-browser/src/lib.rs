pub mod browser;
pub mod chrome;
pub mod cmp;
pub mod error;
pub mod fetch;
pub mod navigator;
pub mod result;

pub use browser::{Browser, BrowserLauncher};
pub use chrome::{ChromeBrowser, ChromeLauncher, ChromeOptions};
pub use cmp::category::{CookieCategory, LabelLanguage};
pub use cmp::{Cmp, CmpMode, CmpType, DETECTION_ORDER, Detection, detect_first};
pub use error::{BrowserError, ExtractionError};
pub use fetch::ResourceFetcher;
pub use navigator::SubpageNavigator;
pub use result::{CookieRecord, Declaration};
