//! `#[tokio_timeout_test]`: async tests with a hard deadline and test-writer logging.
//!
//! ```ignore
//! #[tokio_timeout_test]                          // 30s, current-thread runtime
//! #[tokio_timeout_test(10)]                      // 10s
//! #[tokio_timeout_test(secs = 20, workers = 4)]  // multi-thread runtime
//! ```
//!
//! The test body runs on its own thread so a wedged runtime still fails the
//! test instead of hanging the harness. Crates using the attribute need
//! `tokio` and `tracing-subscriber` (with `env-filter`) as dev-dependencies;
//! log output is filtered by `RUST_LOG`.

use proc_macro::TokenStream;
use quote::quote;
use syn::parse::Parser;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

struct Options {
    secs: u64,
    workers: Option<usize>,
}

fn parse_options(attr: TokenStream) -> syn::Result<Options> {
    let mut options = Options {
        secs: DEFAULT_TIMEOUT_SECS,
        workers: None,
    };
    if attr.is_empty() {
        return Ok(options);
    }
    if let Ok(lit) = syn::parse::<LitInt>(attr.clone()) {
        options.secs = lit.base10_parse()?;
    } else {
        let parser = syn::meta::parser(|meta| {
            if meta.path.is_ident("secs") {
                options.secs = meta.value()?.parse::<LitInt>()?.base10_parse()?;
                Ok(())
            } else if meta.path.is_ident("workers") {
                options.workers = Some(meta.value()?.parse::<LitInt>()?.base10_parse()?);
                Ok(())
            } else {
                Err(meta.error("expected `secs` or `workers`"))
            }
        });
        parser.parse(attr)?;
    }
    if options.secs == 0 {
        return Err(syn::Error::new(
            proc_macro2::Span::call_site(),
            "timeout must be greater than zero",
        ));
    }
    if options.workers == Some(0) {
        return Err(syn::Error::new(
            proc_macro2::Span::call_site(),
            "workers must be greater than zero",
        ));
    }
    Ok(options)
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let options = match parse_options(attr) {
        Ok(options) => options,
        Err(err) => return err.to_compile_error().into(),
    };

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();

    let timeout = options.secs;
    let builder = match options.workers {
        Some(workers) => quote! {
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(#workers)
                .enable_all()
                .build()
        },
        None => quote! {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
        },
    };

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
            let timeout_duration = std::time::Duration::from_secs(#timeout);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = #builder.expect("failed to build Tokio runtime");
                    runtime.block_on(async {
                        tokio::time::timeout(timeout_duration, async move #block)
                            .await
                            .expect("test timed out");
                    });
                }));
                let _ = sender.send(result);
            });
            // Leave the runtime a moment past the inner deadline to report it.
            let outer = timeout_duration + std::time::Duration::from_secs(1);
            match receiver.recv_timeout(outer) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}
