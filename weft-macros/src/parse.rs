use proc_macro2::{Span, TokenStream};
use syn::{Attribute, Meta};

pub(crate) fn parse_int(lit: &syn::Lit, span: Span, field: &str) -> Result<usize, syn::Error> {
    match lit {
        syn::Lit::Int(int) => int.base10_parse::<usize>().map_err(|e| {
            syn::Error::new(span, format!("Failed to parse value of `{field}` as integer: {e}"))
        }),
        _ => Err(syn::Error::new(
            span,
            format!("Failed to parse value of `{field}` as integer."),
        )),
    }
}

/// Whether `attr` is `#[test]`, spelled directly or through a prelude path.
pub(crate) fn is_test_attribute(attr: &Attribute) -> bool {
    let Meta::Path(path) = &attr.meta else {
        return false;
    };

    let segments = path
        .segments
        .iter()
        .map(|s| s.arguments.is_none().then(|| s.ident.to_string()))
        .collect::<Option<Vec<_>>>();

    match segments.as_deref() {
        Some([test]) => path.leading_colon.is_none() && test == "test",
        Some([root, prelude, _, test]) => {
            (root == "core" || root == "std") && prelude == "prelude" && test == "test"
        }
        _ => false,
    }
}

pub(crate) fn token_stream_with_error(mut tokens: TokenStream, error: syn::Error) -> TokenStream {
    tokens.extend(error.into_compile_error());
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use syn::parse_quote;

    #[test]
    fn test_is_test_attribute() {
        let yes: [Attribute; 3] = [
            parse_quote!(#[test]),
            parse_quote!(#[core::prelude::v1::test]),
            parse_quote!(#[std::prelude::rust_2024::test]),
        ];
        assert!(yes.iter().all(is_test_attribute));

        let no: [Attribute; 3] = [
            parse_quote!(#[::test]),
            parse_quote!(#[weft::test]),
            parse_quote!(#[test(worker_threads = 2)]),
        ];
        assert!(!no.iter().any(is_test_attribute));
    }
}
