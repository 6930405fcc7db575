//! Watchdog attributes for tests that talk to timers, subprocesses, or the
//! network. `#[test_timeout::timeout]` wraps a synchronous test and
//! `#[test_timeout::tokio_timeout_test]` wraps an async one; both fail the
//! test with "test timed out" instead of hanging the whole suite. An optional
//! integer argument overrides the 60 second default, e.g.
//! `#[test_timeout::tokio_timeout_test(10)]`.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_LIMIT_SECS: u64 = 60;

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let limit = match parse_limit(attr) {
        Ok(limit) => limit,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs, vis, sig, block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout expects a synchronous test function; use tokio_timeout_test for async",
        )
        .to_compile_error()
        .into();
    }

    let attrs = strip_test_markers(attrs);
    let payload = quote! {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| #block));
    };
    let body = watchdog(limit, payload);

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig { #body }
    })
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let limit = match parse_limit(attr) {
        Ok(limit) => limit,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.take().is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test expects an async test function",
        )
        .to_compile_error()
        .into();
    }

    let attrs = strip_test_markers(attrs);
    // The runtime clock races the outer watchdog so an async hang still
    // surfaces as "test timed out" rather than a stuck worker thread.
    let payload = quote! {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build Tokio runtime");
            runtime.block_on(async {
                tokio::time::timeout(limit, async move #block)
                    .await
                    .expect("test timed out");
            });
        }));
    };
    let body = watchdog(limit, payload);

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig { #body }
    })
}

fn parse_limit(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_LIMIT_SECS);
    }
    let lit: LitInt = syn::parse(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
    }
    Ok(secs)
}

/// Runs `payload` (which must bind `result`) on a watcher thread and converts
/// a missed deadline or lost thread into a test panic.
fn watchdog(limit_secs: u64, payload: TokenStream2) -> TokenStream2 {
    quote! {
        let limit = std::time::Duration::from_secs(#limit_secs);
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            #payload
            let _ = done_tx.send(result);
        });
        match done_rx.recv_timeout(limit) {
            Ok(Ok(_)) => {}
            Ok(Err(payload)) => std::panic::resume_unwind(payload),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread exited without reporting a result")
            }
        }
    }
}

/// Drops `#[test]` / `#[tokio::test]` markers so the generated `#[test]` is
/// the only harness entry.
fn strip_test_markers(attrs: Vec<Attribute>) -> Vec<Attribute> {
    attrs
        .into_iter()
        .filter(|attr| {
            let segments: Vec<_> = attr
                .path()
                .segments
                .iter()
                .map(|segment| segment.ident.to_string())
                .collect();
            !matches!(
                segments.as_slice(),
                [single] if single == "test"
            ) && !matches!(
                segments.as_slice(),
                [first, second] if first == "tokio" && second == "test"
            )
        })
        .collect()
}
