//! A continuous stream of hit batches from an index search.
//!
//! Fetches every matching document handle with search-after pagination and
//! can be resumed by passing the sort values of the last emitted hit back in
//! as the starting cursor. Search-after (rather than a server-side scroll) is
//! what makes the stream reentrant: a prefetched page that was never consumed
//! costs nothing, because the cursor only moves when a batch is pushed.
//!
//! Document sources are not fetched; hits carry only ids and sort values.
use std::convert::Infallible;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use bulkexport_core::error::{Error, Result};
use bulkexport_core::traits::{IndexClient, SearchListener};
use bulkexport_core::types::{
    default_sort_keys, Batch, SearchRequest, SearchResponse, SortKey, MAX_PAGE_SIZE,
};
use bulkexport_core::Cursor;

use crate::runtime::{AsyncCallback, GraphStage, StageContext};

/// Construction parameters for an [`IndexSource`].
#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub index_name: String,
    pub query: Value,
    pub starting_cursor: Option<Cursor>,
    pub page_size: usize,
    pub sort_keys: Option<Vec<SortKey>>,
}

impl SourceSettings {
    pub fn new(index_name: impl Into<String>, query: Value, page_size: usize) -> Self {
        Self {
            index_name: index_name.into(),
            query,
            starting_cursor: None,
            page_size,
            sort_keys: None,
        }
    }

    pub fn starting_at(mut self, cursor: Option<Cursor>) -> Self {
        self.starting_cursor = cursor;
        self
    }

    pub fn sorted_by(mut self, sort_keys: Vec<SortKey>) -> Self {
        self.sort_keys = Some(sort_keys);
        self
    }
}

/// If we've been passed a top-level request (query plus sorting, pagination,
/// highlighting...) keep only its `query` member and discard the rest.
pub fn effective_query_text(query: &Value) -> String {
    query.get("query").unwrap_or(query).to_string()
}

pub enum SourceEvent {
    Response(SearchResponse),
    Failure(Error),
}

/// Forwards an index client's completion onto the stage executor. Never
/// touches stage state itself.
struct ResponseListener {
    callback: AsyncCallback<SourceEvent>,
}

impl SearchListener for ResponseListener {
    fn on_response(self: Box<Self>, response: SearchResponse) {
        self.callback.invoke(SourceEvent::Response(response));
    }

    fn on_failure(self: Box<Self>, error: Error) {
        self.callback.invoke(SourceEvent::Failure(error));
    }
}

pub struct IndexSource {
    client: Arc<dyn IndexClient>,
    index_name: String,
    query_text: String,
    page_size: usize,
    sort_keys: Vec<SortKey>,
    cursor: Option<Cursor>,
    prefetched: Option<SearchResponse>,
    awaiting_response: bool,
    demand_pending: bool,
    exhausted: bool,
    emitted_count: u64,
    callback: Option<AsyncCallback<SourceEvent>>,
}

impl IndexSource {
    /// Fails with [`Error::InvalidConfig`] on a page size outside
    /// `(0, MAX_PAGE_SIZE)`, a blank index name, a non-object query or
    /// malformed sort keys. No request is made in that case.
    pub fn new(client: Arc<dyn IndexClient>, settings: SourceSettings) -> Result<Self> {
        if settings.page_size == 0 || settings.page_size >= MAX_PAGE_SIZE {
            return Err(Error::InvalidConfig(format!(
                "page_size ({}) must be between 0 and {} (exclusive)",
                settings.page_size, MAX_PAGE_SIZE
            )));
        }
        if settings.index_name.trim().is_empty() {
            return Err(Error::InvalidConfig("index_name is required".into()));
        }
        if !settings.query.is_object() {
            return Err(Error::InvalidConfig("query must be a JSON object".into()));
        }
        let sort_keys = settings.sort_keys.unwrap_or_else(default_sort_keys);
        if sort_keys.is_empty() {
            return Err(Error::InvalidConfig("sort_keys must not be empty".into()));
        }
        if let Some(blank) = sort_keys.iter().position(|k| k.field.trim().is_empty()) {
            return Err(Error::InvalidConfig(format!(
                "sort key #{blank} has a blank field name"
            )));
        }

        Ok(Self {
            client,
            index_name: settings.index_name,
            query_text: effective_query_text(&settings.query),
            page_size: settings.page_size,
            sort_keys,
            cursor: settings.starting_cursor,
            prefetched: None,
            awaiting_response: false,
            demand_pending: false,
            exhausted: false,
            emitted_count: 0,
            callback: None,
        })
    }

    pub fn query_text(&self) -> &str {
        &self.query_text
    }

    fn request_next_page(&mut self) -> Result<()> {
        if self.awaiting_response {
            return Err(Error::ProtocolViolation(
                "a search request is already in flight".into(),
            ));
        }
        if self.prefetched.is_some() {
            return Err(Error::ProtocolViolation(
                "requested a page while one is still buffered".into(),
            ));
        }
        let Some(callback) = self.callback.clone() else {
            return Err(Error::ProtocolViolation(
                "search requested before the stage started".into(),
            ));
        };
        let request = SearchRequest {
            index_name: self.index_name.clone(),
            query_text: self.query_text.clone(),
            page_size: self.page_size,
            sort_keys: self.sort_keys.clone(),
            cursor: self.cursor.clone(),
        };
        debug!(index = %self.index_name, cursor = ?self.cursor, "requesting page");
        self.awaiting_response = true;
        self.client
            .search_async(request, Box::new(ResponseListener { callback }));
        Ok(())
    }

    /// Push the response's hits downstream and advance the cursor. Returns
    /// whether a further page may exist.
    fn emit(&mut self, response: SearchResponse, ctx: &mut StageContext<Self>) -> Result<bool> {
        info!(
            "Completed {} of {} total hits",
            self.emitted_count,
            response.total_display()
        );
        let size = response.hits.len();
        if size > self.page_size {
            return Err(Error::ProtocolViolation(format!(
                "index returned {} hits for a page of {}",
                size, self.page_size
            )));
        }
        let Some(batch) = Batch::new(response.hits) else {
            ctx.complete_stage();
            return Ok(false);
        };
        let last = batch.cursor().clone();

        info!("emitting {}", size);
        self.demand_pending = false;
        ctx.push(batch)?;
        self.emitted_count += size as u64;
        debug!("last item pushed({}): {}", size, last);
        self.cursor = Some(last);

        if size < self.page_size {
            self.exhausted = true;
            return Ok(false);
        }
        Ok(true)
    }

    fn handle_response(
        &mut self,
        response: SearchResponse,
        ctx: &mut StageContext<Self>,
    ) -> Result<()> {
        if !self.awaiting_response {
            return Err(Error::ProtocolViolation(
                "search response arrived with no request outstanding".into(),
            ));
        }
        self.awaiting_response = false;
        info!(
            "Index response took {:?} for {} total hits",
            response.took,
            response.total_display()
        );

        if response.hits.is_empty() {
            debug!("completing stage");
            ctx.complete_stage();
            return Ok(());
        }

        if self.demand_pending {
            debug!(
                "Received data from index. Downstream has already pulled and is waiting for data"
            );
            if self.emit(response, ctx)? {
                // fetch the next page so it is ready by the time downstream asks
                self.request_next_page()?;
            }
        } else {
            debug!("Received data from index. Downstream has not yet asked for it");
            info!("stashing response with {} items", response.hits.len());
            self.prefetched = Some(response);
        }
        Ok(())
    }
}

impl GraphStage for IndexSource {
    type In = Infallible;
    type Out = Batch;
    type Event = SourceEvent;
    type Mat = Option<Cursor>;

    fn name(&self) -> &'static str {
        "index-source"
    }

    fn pre_start(&mut self, ctx: &mut StageContext<Self>) -> Result<()> {
        self.callback = Some(ctx.create_async_callback(|event: SourceEvent| event));
        self.request_next_page()
    }

    fn on_pull(&mut self, ctx: &mut StageContext<Self>) -> Result<()> {
        debug!("Pull requested from downstream");
        if let Some(response) = self.prefetched.take() {
            debug!("Downstream is pulling data and we already have data ready");
            if self.emit(response, ctx)? && !self.awaiting_response {
                self.request_next_page()?;
            }
            return Ok(());
        }
        if self.demand_pending {
            return Err(Error::ProtocolViolation(
                "downstream is pulling more than once".into(),
            ));
        }
        if self.exhausted {
            debug!("last page was short, nothing more to fetch");
            ctx.complete_stage();
            return Ok(());
        }
        self.demand_pending = true;
        if self.awaiting_response {
            debug!("Downstream is pulling data. Already waiting for data");
        } else {
            debug!("Downstream is pulling data. We must go and get it");
            self.request_next_page()?;
        }
        Ok(())
    }

    fn on_event(&mut self, event: SourceEvent, ctx: &mut StageContext<Self>) -> Result<()> {
        match event {
            SourceEvent::Response(response) => self.handle_response(response, ctx),
            SourceEvent::Failure(error) => {
                self.awaiting_response = false;
                ctx.fail_stage(error);
                Ok(())
            }
        }
    }

    fn post_stop(&mut self) -> Option<Cursor> {
        let cursor = self
            .cursor
            .as_ref()
            .map_or_else(|| "none".to_string(), ToString::to_string);
        info!(emitted = self.emitted_count, cursor = %cursor, "index source stopped");
        self.prefetched = None;
        self.cursor.take()
    }
}
