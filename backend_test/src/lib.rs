use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{parse_macro_input, spanned::Spanned, Attribute, FnArg, ItemFn, Pat, Signature, Type};

/// Transform an asynchronous test into a synchronous one, inject dependencies,
/// and ensure that any database is dropped regardless of how the test terminates.
///
/// Injectable dependencies are [`rocket::local::asynchronous::Client`], wrapping
/// a server over a fresh in-memory store, and [`mongodb::Database`], a fresh
/// database on the server named by `DB_URI`. `#[ignore]` attributes on the test
/// are kept on the generated test.
#[proc_macro_attribute]
pub fn backend_test(args: TokenStream, input: TokenStream) -> TokenStream {
    if !args.is_empty() {
        return syn::Error::new(
            TokenStream2::from(args).span(),
            "`backend_test` takes no arguments",
        )
        .into_compile_error()
        .into();
    }
    let mut item_fn = parse_macro_input!(input as ItemFn);

    // Extract type information and reject invalid function signatures.
    let injected = match check_sig(item_fn.sig.clone()) {
        Ok(injected) => injected,
        Err(err) => {
            return err.into_compile_error().into();
        }
    };

    // Attributes that must apply to the generated test rather than the future.
    let (outer_attrs, inner_attrs): (Vec<Attribute>, Vec<Attribute>) = item_fn
        .attrs
        .drain(..)
        .partition(|attr| attr.path.is_ident("ignore") || attr.path.is_ident("should_panic"));
    item_fn.attrs = inner_attrs;

    // Rename the future so the test can have its original name.
    let name = item_fn.sig.ident.clone();
    let new_name = format_ident!("{}_fut", name);
    item_fn.sig.ident = new_name.clone();

    let setup_client = if injected.client {
        quote! {
            Some(
                rocket::local::asynchronous::Client::tracked(crate::rocket_for_memory_store().await)
                    .await
                    .unwrap(),
            )
        }
    } else {
        quote! { None }
    };
    let setup_db = if injected.db {
        quote! { Some(crate::test_database().await) }
    } else {
        quote! { None }
    };
    let test_args = injected.args;

    // Rewrite the test function.
    quote! {
        #[test]
        #(#outer_attrs)*
        fn #name() {
            /// Test setup.
            async fn setup() -> (
                Option<rocket::local::asynchronous::Client>,
                Option<mongodb::Database>,
            ) {
                (#setup_client, #setup_db)
            }

            /// The test itself.
            #item_fn

            /// Test cleanup.
            async fn cleanup(db: Option<mongodb::Database>) {
                if let Some(db) = db {
                    db.drop(None).await.unwrap();
                }
            }

            // Create an async runtime. We need a separate one for inside and
            // outside the `catch_unwind`.
            let outer_runtime = rocket::tokio::runtime::Builder::new_multi_thread()
                .thread_name("test-setup-cleanup")
                .worker_threads(1)
                .enable_all()
                .build()
                .unwrap();
            let inner_runtime = rocket::tokio::runtime::Builder::new_multi_thread()
                .thread_name("rocket-worker-test-thread")
                .worker_threads(1)
                .enable_all()
                .build()
                .unwrap();

            // Run the setup.
            let (rocket_client, db) = outer_runtime.block_on(setup());

            // Run the test, catching any panics.
            // Use mutexes to safely transfer `!UnwindSafe` data.
            let client_mutex = std::sync::Mutex::new(rocket_client);
            let db_mutex = std::sync::Mutex::new(db.clone());
            let runtime_mutex = std::sync::Mutex::new(inner_runtime);
            let result = std::panic::catch_unwind(|| {
                #[allow(unused_variables)]
                let rocket_client = client_mutex.into_inner().unwrap();
                #[allow(unused_variables)]
                let db = db_mutex.into_inner().unwrap();
                let runtime = runtime_mutex.into_inner().unwrap();

                runtime.block_on(#new_name(#(#test_args),*));
            });

            // Run the cleanup.
            outer_runtime.block_on(cleanup(db));

            // If the test panicked, re-raise the panic.
            if let Err(cause) = result {
                std::panic::resume_unwind(cause);
            }
        }
    }
    .into()
}

/// What a test asked to have injected.
struct Injected {
    args: Vec<TokenStream2>,
    client: bool,
    db: bool,
}

/// Ensure the wrapped test is async, extract parameters to inject, and reject unknown parameters.
fn check_sig(sig: Signature) -> Result<Injected, syn::Error> {
    if sig.asyncness.is_none() {
        return Err(syn::Error::new(sig.span(), "Test must be marked `async`"));
    }

    let mut injected = Injected {
        args: vec![],
        client: false,
        db: false,
    };

    for input in &sig.inputs {
        if let FnArg::Typed(pat_type) = input {
            if let (Pat::Ident(_), Type::Path(type_path)) = (&*pat_type.pat, &*pat_type.ty) {
                if let Some(last) = type_path.path.segments.last() {
                    if last.ident == "Client" {
                        if injected.client {
                            return Err(syn::Error::new(
                                input.span(),
                                "Test cannot accept more than one `rocket::local::asynchronous::Client`",
                            ));
                        }
                        injected.client = true;
                        injected.args.push(quote! { rocket_client.unwrap() });
                        continue;
                    } else if last.ident == "Database" {
                        if injected.db {
                            return Err(syn::Error::new(
                                input.span(),
                                "Test cannot accept more than one `mongodb::Database`",
                            ));
                        }
                        injected.db = true;
                        injected.args.push(quote! { db.unwrap() });
                        continue;
                    }
                }
            }
        }

        return Err(syn::Error::new(
            input.span(),
            "Expected one of `client_ident: Client` or `db_ident: Database`",
        ));
    }

    Ok(injected)
}
