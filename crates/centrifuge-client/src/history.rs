//! Bidirectional history pagination.
//!
//! [`HistoryPager`] walks a channel stream page by page. When a page comes
//! back shorter than the limit the end of the stream in the current direction
//! was reached, and the pager turns around so the next page continues from
//! the boundary publication in the opposite direction.

use async_trait::async_trait;

use crate::protocol::error_code;
use crate::types::{HistoryOptions, HistoryResult, Publication, StreamPosition};
use crate::{Client, Error};

/// Anything that can answer a history query for a channel.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn history(&self, channel: &str, options: HistoryOptions)
    -> Result<HistoryResult, Error>;
}

#[async_trait]
impl HistorySource for Client {
    async fn history(
        &self,
        channel: &str,
        options: HistoryOptions,
    ) -> Result<HistoryResult, Error> {
        Client::history(self, channel, options).await
    }
}

/// One page returned by [`HistoryPager::next_page`].
#[derive(Debug, Clone)]
pub struct HistoryPage {
    pub publications: Vec<Publication>,
    /// Direction this page was fetched in.
    pub reverse: bool,
    /// The page was short: the stream end in this direction was reached and
    /// the next page goes the other way.
    pub end_reached: bool,
    /// The stream epoch changed; pagination restarted from the stream edge.
    pub reset: bool,
    pub epoch: String,
}

#[derive(Debug, Clone)]
pub struct HistoryPager {
    channel: String,
    limit: u32,
    reverse: bool,
    since: Option<StreamPosition>,
    epoch: Option<String>,
}

impl HistoryPager {
    /// A forward pager over `channel`. A zero limit is raised to 1.
    pub fn new(channel: impl Into<String>, limit: u32) -> Self {
        Self {
            channel: channel.into(),
            limit: limit.max(1),
            reverse: false,
            since: None,
            epoch: None,
        }
    }

    /// Start in reverse (newest first).
    pub fn reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn is_reverse(&self) -> bool {
        self.reverse
    }

    /// Anchor the next page is fetched from.
    pub fn position(&self) -> Option<&StreamPosition> {
        self.since.as_ref()
    }

    fn options(&self) -> HistoryOptions {
        HistoryOptions {
            limit: self.limit,
            since: self.since.clone(),
            reverse: self.reverse,
        }
    }

    fn restart(&mut self) {
        self.since = None;
        self.epoch = None;
    }

    pub async fn next_page<S>(&mut self, source: &S) -> Result<HistoryPage, Error>
    where
        S: HistorySource + ?Sized,
    {
        let mut reset = false;
        let mut result = match source.history(&self.channel, self.options()).await {
            Err(Error::Server { code, .. })
                if code == error_code::UNRECOVERABLE_POSITION && self.since.is_some() =>
            {
                tracing::warn!(channel = %self.channel, "history position lost, restarting");
                self.restart();
                reset = true;
                source.history(&self.channel, self.options()).await?
            }
            other => other?,
        };

        if let Some(epoch) = &self.epoch
            && *epoch != result.epoch
        {
            tracing::warn!(
                channel = %self.channel,
                old_epoch = %epoch,
                new_epoch = %result.epoch,
                "history epoch changed, restarting"
            );
            self.restart();
            reset = true;
            result = source.history(&self.channel, self.options()).await?;
        }
        self.epoch = Some(result.epoch.clone());

        let reverse = self.reverse;
        if let Some(last) = result.publications.last() {
            self.since = Some(StreamPosition {
                offset: last.offset,
                epoch: result.epoch.clone(),
            });
        }

        let end_reached = result.publications.len() < self.limit as usize;
        if end_reached {
            self.reverse = !self.reverse;
            // Step past the boundary so the first page of the new direction
            // starts with it.
            if let Some(sp) = self.since.as_mut() {
                if self.reverse {
                    sp.offset += 1;
                } else {
                    sp.offset = sp.offset.saturating_sub(1);
                }
            }
            tracing::debug!(channel = %self.channel, reverse = self.reverse, "history direction inverted");
        }

        Ok(HistoryPage {
            publications: result.publications,
            reverse,
            end_reached,
            reset,
            epoch: result.epoch,
        })
    }
}
