//! Expansion logic for `#[taskolo::main]` and `#[taskolo::test]`.
use proc_macro2::{Span, TokenStream};
use quote::{quote, quote_spanned};
use syn::parse::Parser;

use crate::parse::*;

// syn::AttributeArgs does not implement syn::Parse
type AttributeArgs = syn::punctuated::Punctuated<syn::Meta, syn::Token![,]>;

/// Config used in case the attribute arguments fail to build a valid config.
const DEFAULT_ERROR_CONFIG: FinalConfig = FinalConfig { stack_size: None };

/// For a quickstart on how this works, consider:
///
/// ```rust,no_run
/// #[taskolo::main(stack_size = 131072)]
/// fn main() {
///     println!("Hello world");
/// }
/// ```
///
/// The compiler splits the tokens: `args` is everything between the
/// proc_macro parentheses (`stack_size = 131072`) and `item` is the function
/// whose body becomes the runtime's root task.
pub(crate) fn main(args: TokenStream, item: TokenStream) -> TokenStream {
    // If any of the steps for this macro fail, we still want to expand to an
    // item that is as close to the expected output as possible. This helps
    // out IDEs such that completions and other related features keep working.
    let input: ItemFn = match syn::parse2(item.clone()) {
        Ok(it) => it,
        Err(e) => return token_stream_with_error(item, e),
    };

    let config = if input.sig.ident == "main" && !input.sig.inputs.is_empty() {
        let msg = "the main function cannot accept arguments";
        Err(syn::Error::new_spanned(&input.sig.ident, msg))
    } else {
        AttributeArgs::parse_terminated
            .parse2(args)
            .and_then(|args| build_config(&input, args, false))
    };

    match config {
        Ok(config) => parse_knobs(input, false, config),
        Err(e) => token_stream_with_error(parse_knobs(input, false, DEFAULT_ERROR_CONFIG), e),
    }
}

pub(crate) fn test(args: TokenStream, item: TokenStream) -> TokenStream {
    let input: ItemFn = match syn::parse2(item.clone()) {
        Ok(it) => it,
        Err(e) => return token_stream_with_error(item, e),
    };
    let config = if let Some(attr) = input.attrs().find(|attr| is_test_attribute(attr)) {
        let msg = "second test attribute is supplied, consider removing or changing the order of your test attributes";
        Err(syn::Error::new_spanned(attr, msg))
    } else {
        AttributeArgs::parse_terminated
            .parse2(args)
            .and_then(|args| build_config(&input, args, true))
    };

    match config {
        Ok(config) => parse_knobs(input, true, config),
        Err(e) => token_stream_with_error(parse_knobs(input, true, DEFAULT_ERROR_CONFIG), e),
    }
}

struct FinalConfig {
    stack_size: Option<usize>,
}

struct ConfigBuilder {
    stack_size: Option<(usize, Span)>,
    is_test: bool,
}

impl ConfigBuilder {
    fn new(is_test: bool) -> Self {
        ConfigBuilder {
            stack_size: None,
            is_test,
        }
    }

    fn macro_name(&self) -> &'static str {
        if self.is_test {
            "taskolo::test"
        } else {
            "taskolo::main"
        }
    }

    fn set_stack_size(&mut self, stack_size: syn::Lit, span: Span) -> Result<(), syn::Error> {
        if self.stack_size.is_some() {
            return Err(syn::Error::new(span, "`stack_size` set multiple times."));
        }

        let stack_size = parse_int(stack_size, span, "stack_size")?;
        if stack_size == 0 {
            return Err(syn::Error::new(span, "`stack_size` may not be 0."));
        }
        self.stack_size = Some((stack_size, span));

        Ok(())
    }

    fn build(&self) -> Result<FinalConfig, syn::Error> {
        Ok(FinalConfig {
            stack_size: self.stack_size.map(|(size, _)| size),
        })
    }
}

fn build_config(
    input: &ItemFn,
    args: AttributeArgs,
    is_test: bool,
) -> Result<FinalConfig, syn::Error> {
    if let Some(async_token) = &input.sig.asyncness {
        let msg = "taskolo tasks are plain functions; remove the `async` keyword";
        return Err(syn::Error::new_spanned(async_token, msg));
    }

    let mut config = ConfigBuilder::new(is_test);
    let macro_name = config.macro_name();

    for arg in args {
        match arg {
            syn::Meta::NameValue(namevalue) => {
                let ident = namevalue
                    .path
                    .get_ident()
                    .ok_or_else(|| {
                        syn::Error::new_spanned(&namevalue, "Must have specified ident")
                    })?
                    .to_string()
                    .to_lowercase();
                let lit = match &namevalue.value {
                    syn::Expr::Lit(syn::ExprLit { lit, .. }) => lit,
                    expr => return Err(syn::Error::new_spanned(expr, "Must be a literal")),
                };
                match ident.as_str() {
                    "stack_size" => {
                        config.set_stack_size(lit.clone(), syn::spanned::Spanned::span(lit))?;
                    }
                    name => {
                        let msg =
                            format!("Unknown attribute {name} is specified; expected `stack_size`");
                        return Err(syn::Error::new_spanned(namevalue, msg));
                    }
                }
            }
            syn::Meta::Path(path) => {
                let name = path
                    .get_ident()
                    .ok_or_else(|| syn::Error::new_spanned(&path, "Must have specified ident"))?
                    .to_string()
                    .to_lowercase();
                let msg = match name.as_str() {
                    "stack_size" => {
                        format!("The `{name}` attribute requires an argument, e.g. #[{macro_name}(stack_size = 131072)]")
                    }
                    name => {
                        format!("Unknown attribute {name} is specified; expected `stack_size`")
                    }
                };
                return Err(syn::Error::new_spanned(path, msg));
            }
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    "Unknown attribute inside the macro",
                ));
            }
        }
    }

    config.build()
}

fn parse_knobs(input: ItemFn, is_test: bool, config: FinalConfig) -> TokenStream {
    // If a type mismatch occurs, the current rustc points to the last
    // statement.
    let (last_stmt_start_span, last_stmt_end_span) = {
        let mut last_stmt = input.stmts.last().cloned().unwrap_or_default().into_iter();

        // `Span` on stable Rust has a limitation that only points to the
        // first token, not the whole tokens. We can work around this
        // limitation by using the first/last span of the tokens like
        // `syn::Error::new_spanned` does.
        let start = last_stmt.next().map_or_else(Span::call_site, |t| t.span());
        let end = last_stmt.last().map_or(start, |t| t.span());
        (start, end)
    };

    let mut rt = quote_spanned! {last_stmt_start_span=>
        taskolo::runtime::Builder::new()
    };

    if let Some(v) = config.stack_size {
        rt = quote_spanned! {last_stmt_start_span=> #rt.stack_size(#v) };
    }

    let generated_attrs = if is_test {
        quote! {
            #[::core::prelude::v1::test]
        }
    } else {
        quote! {}
    };

    let body_ident = quote! { body };
    // This explicit `return` is intentional: it pins the error span of a
    // return-type mismatch onto the function body.
    let last_block = quote_spanned! {last_stmt_end_span=>
        #[allow(clippy::expect_used, clippy::needless_return)]
        {
            return #rt
                .try_build()
                .expect("Failed building the Runtime")
                .block_on(#body_ident);
        }
    };

    let fn_body = input.body();
    let body = quote! {
        let body = move || #fn_body;
    };

    input.into_tokens(generated_attrs, body, last_block)
}
