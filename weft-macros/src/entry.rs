//! Expansion of `#[weft::main]` and `#[weft::test]`.
use proc_macro2::{Span, TokenStream};
use quote::{quote, quote_spanned};
use syn::parse::Parser;
use syn::punctuated::Punctuated;
use syn::spanned::Spanned;
use syn::{ItemFn, Meta, Token};

use crate::parse::*;

const KNOBS: [&str; 3] = ["worker_threads", "comm_tasks", "stack_size"];

#[derive(Clone, Copy, PartialEq, Eq)]
enum Entry {
    Main,
    Test,
}

impl Entry {
    fn macro_name(self) -> &'static str {
        match self {
            Entry::Main => "weft::main",
            Entry::Test => "weft::test",
        }
    }
}

/// For example:
///
/// ```rust,no_run
/// #[weft::main(worker_threads = 2)]
/// fn main() {
///     println!("Hello world");
/// }
/// ```
///
/// `args` is everything between the attribute parentheses, here
/// `worker_threads = 2`, and `item` is the function itself. Its body becomes
/// the main task of a runtime that is torn down when the body returns.
pub(crate) fn main(args: TokenStream, item: TokenStream) -> TokenStream {
    entry(Entry::Main, args, item)
}

pub(crate) fn test(args: TokenStream, item: TokenStream) -> TokenStream {
    entry(Entry::Test, args, item)
}

fn entry(kind: Entry, args: TokenStream, item: TokenStream) -> TokenStream {
    let input: ItemFn = match syn::parse2(item.clone()) {
        Ok(input) => input,
        Err(e) => return token_stream_with_error(item, e),
    };

    // On a bad attribute we still expand the function with default knobs, so
    // that IDE completions keep working inside the body.
    match check_signature(kind, &input).and_then(|()| Knobs::parse(kind, args)) {
        Ok(knobs) => expand(kind, input, knobs),
        Err(e) => token_stream_with_error(expand(kind, input, Knobs::default()), e),
    }
}

fn check_signature(kind: Entry, input: &ItemFn) -> Result<(), syn::Error> {
    if let Some(asyncness) = &input.sig.asyncness {
        let msg = "weft tasks are plain functions, remove the `async` keyword";
        return Err(syn::Error::new_spanned(asyncness, msg));
    }

    match kind {
        Entry::Main if input.sig.ident == "main" && !input.sig.inputs.is_empty() => Err(
            syn::Error::new_spanned(&input.sig.ident, "the main function cannot accept arguments"),
        ),
        Entry::Test => match input.attrs.iter().find(|attr| is_test_attribute(attr)) {
            Some(attr) => Err(syn::Error::new_spanned(
                attr,
                "second test attribute is supplied, consider removing or changing the order of your test attributes",
            )),
            None => Ok(()),
        },
        Entry::Main => Ok(()),
    }
}

/// Runtime settings accepted by the attributes, in [`KNOBS`] order.
#[derive(Default)]
struct Knobs {
    values: [Option<usize>; 3],
}

impl Knobs {
    fn parse(kind: Entry, args: TokenStream) -> Result<Self, syn::Error> {
        let metas = Punctuated::<Meta, Token![,]>::parse_terminated.parse2(args)?;

        let mut knobs = Knobs::default();
        for meta in metas {
            knobs.set(kind, meta)?;
        }

        // Unless told otherwise a test runs on its own thread only, so tasks
        // run whenever the test body waits.
        if kind == Entry::Test && knobs.values[0].is_none() {
            knobs.values[0] = Some(1);
        }

        Ok(knobs)
    }

    fn set(&mut self, kind: Entry, meta: Meta) -> Result<(), syn::Error> {
        let name = meta
            .path()
            .get_ident()
            .ok_or_else(|| syn::Error::new_spanned(&meta, "Must have specified ident"))?
            .to_string()
            .to_lowercase();

        let Some(slot) = KNOBS.iter().position(|knob| *knob == name) else {
            let known = KNOBS.map(|knob| format!("`{knob}`")).join(", ");
            let msg = format!(
                "Unknown attribute {name} is specified; #[{}] expects one of: {known}",
                kind.macro_name()
            );
            return Err(syn::Error::new_spanned(&meta, msg));
        };

        let lit = match &meta {
            Meta::NameValue(nv) => match &nv.value {
                syn::Expr::Lit(syn::ExprLit { lit, .. }) => lit,
                expr => return Err(syn::Error::new_spanned(expr, "Must be a literal")),
            },
            _ => {
                let msg = format!("The `{name}` attribute requires an argument.");
                return Err(syn::Error::new_spanned(&meta, msg));
            }
        };

        if self.values[slot].is_some() {
            let msg = format!("`{name}` set multiple times.");
            return Err(syn::Error::new_spanned(&meta, msg));
        }

        let value = parse_int(lit, lit.span(), &name)?;
        if slot == 0 && value == 0 {
            return Err(syn::Error::new_spanned(lit, "`worker_threads` may not be 0."));
        }

        self.values[slot] = Some(value);
        Ok(())
    }
}

fn expand(kind: Entry, input: ItemFn, knobs: Knobs) -> TokenStream {
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = input;

    // Type errors in the body get reported on its last statement.
    let span = block
        .stmts
        .last()
        .map_or_else(Span::call_site, |stmt| stmt.span());

    let setters = KNOBS
        .iter()
        .zip(knobs.values)
        .filter_map(|(knob, value)| {
            let setter = syn::Ident::new(knob, span);
            value.map(|v| quote_spanned! {span=> .#setter(#v) })
        });

    let test_attr = match kind {
        Entry::Test => quote! { #[::core::prelude::v1::test] },
        Entry::Main => quote! {},
    };

    let output = match &sig.output {
        syn::ReturnType::Default => quote! { () },
        syn::ReturnType::Type(_, ty) => quote! { #ty },
    };

    // The explicit `return` keeps the body's own type errors pointing at the
    // body, see tokio-rs/tokio#4636.
    let run = quote_spanned! {span=>
        #[allow(clippy::expect_used, clippy::needless_return)]
        {
            let runtime = weft::runtime::Builder::new()
                #(#setters)*
                .try_init()
                .expect("Failed to initialize the weft runtime");
            let output = runtime.call_main(body);
            runtime.teardown();
            return output;
        }
    };

    quote! {
        #(#attrs)*
        #test_attr
        #vis #sig {
            let body = || -> #output #block;
            #run
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syn::parse_quote;

    #[test]
    fn test_knobs_in_declaration_order() -> Result<(), syn::Error> {
        let knobs = Knobs::parse(Entry::Main, quote! { stack_size = 65536, worker_threads = 4 })?;
        assert_eq!(knobs.values, [Some(4), None, Some(65536)]);

        let knobs = Knobs::parse(Entry::Test, TokenStream::new())?;
        assert_eq!(knobs.values, [Some(1), None, None]);
        Ok(())
    }

    #[test]
    fn test_bad_knobs_rejected() {
        let bad = [
            quote! { flavor = "local" },
            quote! { worker_threads },
            quote! { worker_threads = 0 },
            quote! { worker_threads = "four" },
            quote! { comm_tasks = 1, comm_tasks = 2 },
        ];

        for args in bad {
            assert!(Knobs::parse(Entry::Main, args.clone()).is_err(), "accepted `{args}`");
        }
    }

    #[test]
    fn test_signature_checks() {
        let plain: ItemFn = parse_quote! { fn main() {} };
        assert!(check_signature(Entry::Main, &plain).is_ok());

        let asyncness: ItemFn = parse_quote! { async fn main() {} };
        assert!(check_signature(Entry::Main, &asyncness).is_err());

        let args: ItemFn = parse_quote! { fn main(argc: i32) {} };
        assert!(check_signature(Entry::Main, &args).is_err());

        let twice: ItemFn = parse_quote! { #[test] fn check() {} };
        assert!(check_signature(Entry::Test, &twice).is_err());
    }
}
