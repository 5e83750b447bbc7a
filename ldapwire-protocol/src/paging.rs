//! Simple paged results iteration.
//!
//! ```text
//! Idle -> Requesting -> AwaitingResponse -+-> HasMoreCookie -> Requesting ...
//!                                         +-> Done
//! ```
//!
//! [`PagedSearch`] never loops on its own: the caller asks for the next
//! request, sends it, and hands back the controls of each search-done
//! message. The cookie a server returns is copied into the next request.

use crate::control::{find_control, Control, ControlPaging, CONTROL_TYPE_PAGING};
use crate::error::ProtocolError;
use crate::search::SearchRequest;
use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PagingState {
    Idle,
    Requesting,
    AwaitingResponse,
    HasMoreCookie,
    Done,
}

/// Cursor over the pages of one search.
#[derive(Debug, Clone)]
pub struct PagedSearch {
    request: SearchRequest,
    control_index: usize,
    state: PagingState,
    pages: usize,
}

impl PagedSearch {
    /// Prepares `request` for paging. An existing paging control is reused
    /// with its page size replaced; otherwise one is appended.
    pub fn new(mut request: SearchRequest, page_size: u32) -> Self {
        let existing = request
            .controls
            .iter()
            .position(|c| c.control_type() == CONTROL_TYPE_PAGING);

        let control_index = match existing {
            Some(index) => {
                match request.controls[index].as_paging_mut() {
                    Some(paging) => paging.page_size = page_size,
                    // Registered as opaque; replace it with a typed control.
                    None => request.controls[index] = Control::paging(page_size),
                }
                index
            }
            None => {
                request.controls.push(Control::paging(page_size));
                request.controls.len() - 1
            }
        };

        Self {
            request,
            control_index,
            state: PagingState::Idle,
            pages: 0,
        }
    }

    pub fn state(&self) -> PagingState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == PagingState::Done
    }

    /// Number of pages handled so far.
    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn request(&self) -> &SearchRequest {
        &self.request
    }

    fn paging(&self) -> Option<&ControlPaging> {
        self.request
            .controls
            .get(self.control_index)
            .and_then(Control::as_paging)
    }

    /// Cookie that the next request will carry.
    pub fn cookie(&self) -> Bytes {
        self.paging().map(|p| p.cookie.clone()).unwrap_or_default()
    }

    /// Returns the request for the next page.
    pub fn next_request(&mut self) -> Result<SearchRequest, ProtocolError> {
        match self.state {
            PagingState::Idle | PagingState::HasMoreCookie => {
                self.state = PagingState::Requesting;
                Ok(self.request.clone())
            }
            PagingState::Done => Err(ProtocolError::InvalidPagingState(
                "all pages have been received",
            )),
            _ => Err(ProtocolError::InvalidPagingState(
                "previous page has not been handled",
            )),
        }
    }

    /// Records that the request from [`next_request`](Self::next_request)
    /// went out.
    pub fn mark_sent(&mut self) -> Result<(), ProtocolError> {
        if self.state != PagingState::Requesting {
            return Err(ProtocolError::InvalidPagingState("no request is pending"));
        }
        self.state = PagingState::AwaitingResponse;
        Ok(())
    }

    /// Consumes the controls of a search-done message.
    ///
    /// A missing paging control or an empty cookie ends the iteration.
    pub fn handle_page(&mut self, controls: &[Control]) -> Result<PagingState, ProtocolError> {
        if self.state != PagingState::AwaitingResponse {
            return Err(ProtocolError::InvalidPagingState(
                "page received without an outstanding request",
            ));
        }
        self.pages += 1;

        let cookie = find_control(controls, CONTROL_TYPE_PAGING)
            .and_then(Control::as_paging)
            .map(|p| p.cookie.clone())
            .filter(|cookie| !cookie.is_empty());

        self.state = match cookie {
            Some(cookie) => {
                if let Some(paging) = self
                    .request
                    .controls
                    .get_mut(self.control_index)
                    .and_then(Control::as_paging_mut)
                {
                    paging.set_cookie(cookie);
                }
                PagingState::HasMoreCookie
            }
            None => PagingState::Done,
        };
        Ok(self.state)
    }

    /// A page-size-zero request with the current cookie, which tells the
    /// server to release the cursor.
    pub fn abandon_request(&self) -> SearchRequest {
        let mut request = self.request.clone();
        if let Some(paging) = request
            .controls
            .get_mut(self.control_index)
            .and_then(Control::as_paging_mut)
        {
            paging.page_size = 0;
        }
        request
    }
}
