mod common;

use common::{Harness, OTHER_KEY, OTHER_PUB, SIGNING_KEY, SIGNING_PUB};

fn keys_prelude() -> String {
    format!(
        "PRIV = '''{SIGNING_KEY}'''\nPUB = '''{SIGNING_PUB}'''\n\
         OTHER_PRIV = '''{OTHER_KEY}'''\nOTHER_PUB = '''{OTHER_PUB}'''\n"
    )
}

const DEFINE: &str = "\
def define():
    class Token(SignedClass, private_key=PRIV):
        public_key = PUB
    return Token
";

#[test]
fn test_verification_tracks_identity() {
    let h = Harness::new();
    let src = format!(
        "{}{DEFINE}\
         A = define()\n\
         B = define()\n\
         print(A.verify(A), A.verify(B), B.verify(A))\n\
         print(A is B, A.__verifier__ == B.__verifier__)\n",
        keys_prelude()
    );
    let out = h.run(&src).unwrap();
    assert_eq!(out, "True True True\nFalse False\n");
}

#[test]
fn test_copied_or_missing_tokens_fail() {
    let h = Harness::new();
    let src = format!(
        "{}{DEFINE}\
         A = define()\n\
         class Forged:\n    __verifier__ = A.__verifier__\n\
         class Plain:\n    pass\n\
         class Foreign(SignedClass, private_key=OTHER_PRIV):\n    public_key = OTHER_PUB\n\
         print(A.verify(Forged), A.verify(Plain), A.verify(Foreign), Foreign.verify(Foreign))\n\
         print(A.verify(1), A.verify('x'))\n",
        keys_prelude()
    );
    let out = h.run(&src).unwrap();
    assert_eq!(out, "False False False True\nFalse False\n");
}

#[test]
fn test_signed_classes_are_sealed() {
    let h = Harness::new();
    let src = format!("{}{DEFINE}A = define()\nA.__verifier__ = 'tampered'\n", keys_prelude());
    let err = h.run(&src).unwrap_err();
    assert!(err.starts_with("LockedValueError"), "{err}");
}

#[test]
fn test_key_errors() {
    let h = Harness::new();
    let err = h.run("class NoKey(SignedClass):\n    pass\n").unwrap_err();
    assert!(err.starts_with("TypeError"), "{err}");
    let err = h
        .run("class BadKey(SignedClass, private_key='not a pem'):\n    pass\n")
        .unwrap_err();
    assert!(err.starts_with("ValueError"), "{err}");
}
