#[allow( dead_code )]
mod scripted_fetcher {

    use std::collections::VecDeque ;
    use std::sync::{ Arc, Mutex };
    use std::sync::atomic::{ AtomicUsize, Ordering };
    use wasm_host::{ FetchCallback, HttpFetcher, HttpUri };

    /// An [`HttpFetcher`] whose requests stay pending until the test answers them.
    #[derive( Default )]
    pub struct ScriptedFetcher {
        pending: Mutex<VecDeque<( HttpUri, String, FetchCallback )>>,
        fetches: AtomicUsize,
    }

    impl ScriptedFetcher {

        pub fn new() -> Arc<Self> { Arc::default() }

        /// Answers the oldest pending request with `body`. An empty body is a failed fetch.
        pub fn respond( &self, body: &[u8] ) {
            let ( _, _, callback ) = self.pending.lock().unwrap().pop_front().expect( "no pending fetch" );
            callback( body.to_vec() );
        }

        /// Fails the oldest pending request.
        pub fn fail( &self ) { self.respond( &[] ) }

        /// Total number of fetches issued, answered or not.
        pub fn fetch_count( &self ) -> usize { self.fetches.load( Ordering::SeqCst ) }

        /// Number of fetches waiting for an answer.
        pub fn pending( &self ) -> usize { self.pending.lock().unwrap().len() }

        /// Uri of the oldest pending request.
        pub fn pending_uri( &self ) -> Option<String> { self.pending.lock().unwrap().front().map(|( uri, _, _ )| uri.uri.clone() )}

    }

    impl HttpFetcher for ScriptedFetcher {
        fn fetch( &self, uri: &HttpUri, sha256: &str, callback: FetchCallback ) {
            self.fetches.fetch_add( 1, Ordering::SeqCst );
            self.pending.lock().unwrap().push_back(( uri.clone(), sha256.to_string(), callback ));
        }
    }

}
