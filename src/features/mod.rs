//! Feature engineering
//!
//! Turns an instrument's tick window into rolling volume, price and volatility
//! statistics.

mod engineer;
pub mod rolling;

pub use engineer::{
    FeatureEngineer, FeatureIter, FeatureSeries, PRICE_RETURN, PRICE_VOLATILITY, PRICE_ZSCORE,
    VOLUME_MEAN_LONG, VOLUME_MEAN_SHORT, VOLUME_RATIO, VOLUME_ZSCORE,
};
