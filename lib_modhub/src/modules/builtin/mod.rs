//! Module kinds shipped with the runtime.

pub mod limit_rank;
pub mod market_data;
pub mod watchlist;

use crate::modules::catalog::ModuleCatalog;

pub use limit_rank::LimitRankModule;
pub use market_data::MarketDataModule;
pub use watchlist::WatchlistModule;

pub fn register_all(catalog: &mut ModuleCatalog) {
    catalog.register(market_data::KIND, || Box::new(MarketDataModule::default()));
    catalog.register(watchlist::KIND, || Box::new(WatchlistModule::default()));
    catalog.register(limit_rank::KIND, || Box::new(LimitRankModule::default()));
}
