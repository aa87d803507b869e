//! Proc macros for pgtestdb tests.
//!
//! Provides the `#[pgtestdb_test::test]` attribute, which runs an async test
//! body against a fresh clone of a template database.

use proc_macro::TokenStream;
use quote::quote;
use syn::{
    parse::{Parse, ParseStream},
    parse_macro_input, Expr, FnArg, Ident, ItemFn, Pat, Token,
};

/// Arguments for the test macro: `#[test(template = EXPR)]`
struct TestArgs {
    template: Expr,
}

impl Parse for TestArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let ident: Ident = input.parse()?;
        if ident != "template" {
            return Err(syn::Error::new(ident.span(), "expected `template`"));
        }
        let _eq: Token![=] = input.parse()?;
        let template: Expr = input.parse()?;
        Ok(TestArgs { template })
    }
}

/// Runs an async test against a fresh clone of a template.
///
/// # Usage
///
/// ```ignore
/// #[pgtestdb_test::test(template = ACCOUNTS)]
/// async fn inserts_account(conn: _, url: _) -> anyhow::Result<()> {
///     conn.execute("INSERT INTO account VALUES (1)").await?;
///     Ok(())
/// }
/// ```
///
/// This expands to:
///
/// ```ignore
/// #[tokio::test]
/// async fn inserts_account() -> anyhow::Result<()> {
///     if !pgtestdb_test::postgres_available() {
///         eprintln!("skipping inserts_account: PostgreSQL is not available");
///         return Ok(());
///     }
///     pgtestdb_test::with_test_db(&ACCOUNTS, |mut conn, url| async move {
///         // your test code here
///     }).await
/// }
/// ```
///
/// `template` is any expression that derefs to a `TemplateSpec`.
///
/// # Parameters
///
/// - `conn` - a `DbConn` to the clone (always mutable)
/// - `url` - the clone's connection URL
///
/// Both parameters are optional. Use `_` for the type as it will be inferred.
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TestArgs);
    let input_fn = parse_macro_input!(item as ItemFn);

    let template = &args.template;
    let fn_name = &input_fn.sig.ident;
    let fn_body = &input_fn.block;
    let fn_attrs = &input_fn.attrs;
    let fn_vis = &input_fn.vis;

    let mut param_names: Vec<Ident> = Vec::new();
    for arg in &input_fn.sig.inputs {
        if let FnArg::Typed(pat_type) = arg {
            if let Pat::Ident(pat_ident) = &*pat_type.pat {
                param_names.push(pat_ident.ident.clone());
            }
        }
    }

    let closure_params = match param_names.as_slice() {
        [] => quote! { _conn, _url },
        [p1] => quote! { mut #p1, _url },
        [p1, p2] => quote! { mut #p1, #p2 },
        _ => {
            return syn::Error::new_spanned(
                &input_fn.sig.inputs,
                "expected at most two parameters: `conn` and `url`",
            )
            .to_compile_error()
            .into();
        }
    };

    let skip_message = format!("skipping {fn_name}: PostgreSQL is not available");

    let expanded = quote! {
        #(#fn_attrs)*
        #[::tokio::test]
        #[allow(unused_mut)]
        #fn_vis async fn #fn_name() -> ::anyhow::Result<()> {
            if !::pgtestdb_test::postgres_available() {
                eprintln!(#skip_message);
                return Ok(());
            }
            ::pgtestdb_test::with_test_db(&#template, |#closure_params| async move
                #fn_body
            ).await
        }
    };

    TokenStream::from(expanded)
}
